//! Delay strategy: the pure `attempt -> duration` function shared by the retry engine
//! (wait between attempts) and the circuit breaker engine (wait before `Open -> HalfOpen`).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::ConfigError;

/// How a jitter factor perturbs a computed base delay.
///
/// A factor of `0.0` disables jitter. A factor of `f` perturbs the base uniformly within
/// `base * (1 - f) ..= base * (1 + f)`, then clamps at zero (delays never go negative).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter(f64);

impl Jitter {
    /// `factor` must be in `[0, 1]`.
    pub fn new(factor: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(ConfigError::InvalidDelay(format!(
                "jitter factor must be in [0, 1], got {factor}"
            )));
        }
        Ok(Self(factor))
    }

    pub fn none() -> Self {
        Self(0.0)
    }

    pub fn factor(&self) -> f64 {
        self.0
    }

    fn apply_with_rng<R: Rng>(&self, base: Duration, rng: &mut R) -> Duration {
        if self.0 == 0.0 {
            return base;
        }
        let base_millis = base.as_millis() as f64;
        let spread = base_millis * self.0;
        let low = (base_millis - spread).max(0.0);
        let high = base_millis + spread;
        let jittered = if high > low { rng.random_range(low..=high) } else { low };
        Duration::from_millis(jittered.round() as u64)
    }

    fn apply(&self, base: Duration) -> Duration {
        self.apply_with_rng(base, &mut rand::rng())
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::none()
    }
}

type CustomFn = Arc<dyn Fn(u64) -> Duration + Send + Sync>;

/// Delay strategy: `delay_for(attempt) -> Duration`. `attempt` is 1-indexed.
#[derive(Clone)]
pub enum DelayStrategy {
    /// Always zero, regardless of attempt.
    None,
    Constant { delay: Duration, jitter: Jitter },
    Linear { initial: Duration, multiplier: f64, max: Duration, jitter: Jitter },
    Exponential { initial: Duration, multiplier: f64, max: Duration, jitter: Jitter },
    /// A caller-supplied function. Either returns a duration for the engine to wait on, or
    /// performs its own wait and returns `Duration::ZERO` so the engine skips waiting.
    Custom(CustomFn),
}

impl fmt::Debug for DelayStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "DelayStrategy::None"),
            Self::Constant { delay, jitter } => {
                f.debug_struct("DelayStrategy::Constant").field("delay", delay).field("jitter", jitter).finish()
            }
            Self::Linear { initial, multiplier, max, jitter } => f
                .debug_struct("DelayStrategy::Linear")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            Self::Exponential { initial, multiplier, max, jitter } => f
                .debug_struct("DelayStrategy::Exponential")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            Self::Custom(_) => write!(f, "DelayStrategy::Custom(..)"),
        }
    }
}

impl DelayStrategy {
    pub fn none() -> Self {
        Self::None
    }

    pub fn constant(delay: Duration) -> Result<Self, ConfigError> {
        Self::constant_with_jitter(delay, Jitter::none())
    }

    pub fn constant_with_jitter(delay: Duration, jitter: Jitter) -> Result<Self, ConfigError> {
        if delay.is_zero() {
            return Err(ConfigError::InvalidDelay("constant delay must be > 0".into()));
        }
        Ok(Self::Constant { delay, jitter })
    }

    pub fn linear(initial: Duration, multiplier: f64, max: Duration) -> Result<Self, ConfigError> {
        Self::linear_with_jitter(initial, multiplier, max, Jitter::none())
    }

    pub fn linear_with_jitter(
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: Jitter,
    ) -> Result<Self, ConfigError> {
        if initial.is_zero() {
            return Err(ConfigError::InvalidDelay("linear initial must be > 0".into()));
        }
        if multiplier <= 0.0 {
            return Err(ConfigError::InvalidDelay("linear multiplier must be > 0".into()));
        }
        if max < initial {
            return Err(ConfigError::InvalidDelay("linear max must be >= initial".into()));
        }
        Ok(Self::Linear { initial, multiplier, max, jitter })
    }

    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Result<Self, ConfigError> {
        Self::exponential_with_jitter(initial, multiplier, max, Jitter::none())
    }

    pub fn exponential_with_jitter(
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: Jitter,
    ) -> Result<Self, ConfigError> {
        if initial.is_zero() {
            return Err(ConfigError::InvalidDelay("exponential initial must be > 0".into()));
        }
        if multiplier <= 1.0 {
            return Err(ConfigError::InvalidDelay("exponential multiplier must be > 1".into()));
        }
        if max < initial {
            return Err(ConfigError::InvalidDelay("exponential max must be >= initial".into()));
        }
        Ok(Self::Exponential { initial, multiplier, max, jitter })
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u64) -> Duration + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Compute the delay for `attempt` (1-indexed), with jitter already applied.
    pub fn delay_for(&self, attempt: u64) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Constant { delay, jitter } => jitter.apply(*delay),
            Self::Linear { initial, multiplier, max, jitter } => {
                let steps = attempt.saturating_sub(1) as f64;
                let linear_millis = initial.as_millis() as f64 * (1.0 + steps * multiplier);
                let base = Duration::from_millis(linear_millis.round() as u64).min(*max);
                jitter.apply(base)
            }
            Self::Exponential { initial, multiplier, max, jitter } => {
                let steps = attempt.saturating_sub(1) as i32;
                let factor = multiplier.powi(steps);
                let exp_millis = (initial.as_millis() as f64) * factor;
                let base = if exp_millis.is_finite() {
                    Duration::from_millis(exp_millis.round() as u64).min(*max)
                } else {
                    *max
                };
                jitter.apply(base)
            }
            Self::Custom(f) => f(attempt),
        }
    }
}
