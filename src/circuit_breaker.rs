//! Circuit breaker engine (C6): a serialized reducer over `(state, event) -> (state, effects)`.
//!
//! State is a tagged union (`CircuitState`) guarded by a plain `std::sync::Mutex`: all reducer
//! work is O(1) and never suspends, so there is no need for an async lock here (contrast the
//! rate limiter, which does suspend while a caller waits). `Open` and `HalfOpen` carry their
//! timer bases inline, so a reader never needs a side-channel clock lookup to know whether a
//! time-driven transition is due — it reads the state and asks the clock once.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::delay::DelayStrategy;
use crate::error::{CircuitStateKind, ConfigError, ResilienceError};
use crate::event::EventBus;
use crate::window::SlidingWindow;

/// Events emitted by the circuit breaker engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakerEvent {
    StateTransition { from: CircuitStateKind, to: CircuitStateKind, manual: bool },
    RecordedSuccess { rate: f64 },
    RecordedFailure { rate: f64 },
    CallNotPermitted,
    Reset,
}

impl fmt::Display for BreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateTransition { from, to, manual } => {
                write!(f, "breaker {from} -> {to} (manual={manual})")
            }
            Self::RecordedSuccess { rate } => write!(f, "breaker recorded success (rate={rate:.3})"),
            Self::RecordedFailure { rate } => write!(f, "breaker recorded failure (rate={rate:.3})"),
            Self::CallNotPermitted => write!(f, "breaker call not permitted"),
            Self::Reset => write!(f, "breaker reset"),
        }
    }
}

/// Internal tagged state. `Open` and `HalfOpen` carry their own timer bases.
#[derive(Debug, Clone, Copy, PartialEq)]
enum CircuitState {
    Closed,
    Open { delay_duration: Duration, start_time_mark: u64, cycle_transition_count: u64 },
    HalfOpen { calls_attempted: u64, start_time_mark: Option<u64>, cycle_transition_count: u64 },
}

impl CircuitState {
    fn kind(&self) -> CircuitStateKind {
        match self {
            Self::Closed => CircuitStateKind::Closed,
            Self::Open { .. } => CircuitStateKind::Open,
            Self::HalfOpen { .. } => CircuitStateKind::HalfOpen,
        }
    }
}

struct Config<T, E> {
    failure_rate_threshold: f64,
    permitted_calls_in_half_open: u64,
    max_wait_in_half_open: Duration,
    delay_strategy: DelayStrategy,
    record_exception: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    record_result: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

struct Inner {
    state: CircuitState,
    window: SlidingWindow,
}

/// A configured circuit breaker. Construct via [`CircuitBreaker::builder`].
pub struct CircuitBreaker<T, E> {
    config: Config<T, E>,
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    events: EventBus<BreakerEvent>,
}

impl<T, E> fmt::Debug for CircuitBreaker<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("failure_rate_threshold", &self.config.failure_rate_threshold)
            .finish()
    }
}

impl<T, E> CircuitBreaker<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> CircuitBreakerBuilder<T, E> {
        CircuitBreakerBuilder::new()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// First materializes any time-driven transition, then returns the resulting state.
    pub fn current_state(&self) -> CircuitStateKind {
        let (kind, emitted) = self.force_state_update();
        for event in emitted {
            self.emit(event);
        }
        kind
    }

    /// Run `operation` if currently permitted; otherwise reject with `CallNotPermitted`.
    pub async fn execute<Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let (kind, emitted) = self.force_state_update();
        for event in emitted {
            self.emit(event);
        }

        let permitted = {
            let inner = self.inner.lock().expect("circuit breaker mutex poisoned");
            match inner.state {
                CircuitState::Open { .. } => false,
                CircuitState::HalfOpen { calls_attempted, .. } => {
                    calls_attempted < self.config.permitted_calls_in_half_open
                }
                CircuitState::Closed => true,
            }
        };

        if !permitted {
            self.emit(BreakerEvent::CallNotPermitted);
            warn!(state = %kind, "circuit breaker call not permitted");
            return Err(ResilienceError::CallNotPermitted { state: kind });
        }

        match operation().await {
            Ok(value) => {
                let is_failure = (self.config.record_result)(&value);
                let emitted = if is_failure { self.record_failure() } else { self.record_success() };
                for event in emitted {
                    self.emit(event);
                }
                Ok(value)
            }
            Err(e) => {
                let is_failure = (self.config.record_exception)(&e);
                let emitted = if is_failure { self.record_failure() } else { self.record_success() };
                for event in emitted {
                    self.emit(event);
                }
                Err(ResilienceError::Inner(e))
            }
        }
    }

    pub fn transition_to_closed(&self) {
        let emitted = self.manual_transition(CircuitStateKind::Closed);
        for event in emitted {
            self.emit(event);
        }
    }

    pub fn transition_to_open(&self) {
        let emitted = self.manual_transition(CircuitStateKind::Open);
        for event in emitted {
            self.emit(event);
        }
    }

    pub fn transition_to_half_open(&self) {
        let emitted = self.manual_transition(CircuitStateKind::HalfOpen);
        for event in emitted {
            self.emit(event);
        }
    }

    /// Clears the sliding window and returns to `Closed`, always emitting `Reset`.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        let from = inner.state.kind();
        inner.window.clear();
        inner.state = CircuitState::Closed;
        drop(inner);
        let _ = now;
        self.emit(BreakerEvent::Reset);
        if from != CircuitStateKind::Closed {
            self.emit(BreakerEvent::StateTransition { from, to: CircuitStateKind::Closed, manual: true });
        }
    }

    fn emit(&self, event: BreakerEvent) {
        match event {
            BreakerEvent::StateTransition { from, to, manual } => {
                info!(%from, %to, manual, "circuit breaker transition")
            }
            BreakerEvent::CallNotPermitted => warn!("circuit breaker call not permitted"),
            _ => {}
        }
        self.events.emit(event);
    }

    fn force_state_update(&self) -> (CircuitStateKind, Vec<BreakerEvent>) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        let mut emitted = Vec::new();

        match inner.state {
            CircuitState::Open { delay_duration, start_time_mark, cycle_transition_count } => {
                if now.saturating_sub(start_time_mark) >= delay_duration.as_millis() as u64 {
                    let start_time_mark = if self.config.max_wait_in_half_open.is_zero() {
                        None
                    } else {
                        Some(now)
                    };
                    inner.state = CircuitState::HalfOpen {
                        calls_attempted: 0,
                        start_time_mark,
                        cycle_transition_count,
                    };
                    emitted.push(BreakerEvent::StateTransition {
                        from: CircuitStateKind::Open,
                        to: CircuitStateKind::HalfOpen,
                        manual: false,
                    });
                }
            }
            CircuitState::HalfOpen { calls_attempted, start_time_mark: Some(mark), cycle_transition_count } => {
                if !self.config.max_wait_in_half_open.is_zero()
                    && now.saturating_sub(mark) >= self.config.max_wait_in_half_open.as_millis() as u64
                {
                    let next_cycle = cycle_transition_count + 1;
                    inner.state = CircuitState::Open {
                        delay_duration: self.config.delay_strategy.delay_for(next_cycle),
                        start_time_mark: now,
                        cycle_transition_count: next_cycle,
                    };
                    let _ = calls_attempted;
                    emitted.push(BreakerEvent::StateTransition {
                        from: CircuitStateKind::HalfOpen,
                        to: CircuitStateKind::Open,
                        manual: false,
                    });
                }
            }
            _ => {}
        }

        (inner.state.kind(), emitted)
    }

    fn record_failure(&self) -> Vec<BreakerEvent> {
        self.record(true)
    }

    fn record_success(&self) -> Vec<BreakerEvent> {
        self.record(false)
    }

    fn record(&self, failure: bool) -> Vec<BreakerEvent> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        let mut emitted = Vec::new();

        if failure {
            inner.window.record_failure();
        } else {
            inner.window.record_success();
        }
        let rate = inner.window.current_failure_rate();
        emitted.push(if failure {
            BreakerEvent::RecordedFailure { rate }
        } else {
            BreakerEvent::RecordedSuccess { rate }
        });

        match inner.state {
            CircuitState::Closed => {
                if failure && rate >= self.config.failure_rate_threshold {
                    inner.state = CircuitState::Open {
                        delay_duration: self.config.delay_strategy.delay_for(1),
                        start_time_mark: now,
                        cycle_transition_count: 1,
                    };
                    emitted.push(BreakerEvent::StateTransition {
                        from: CircuitStateKind::Closed,
                        to: CircuitStateKind::Open,
                        manual: false,
                    });
                }
            }
            CircuitState::HalfOpen { calls_attempted, start_time_mark, cycle_transition_count } => {
                let calls_attempted = calls_attempted + 1;
                if calls_attempted >= self.config.permitted_calls_in_half_open {
                    if rate < self.config.failure_rate_threshold {
                        inner.state = CircuitState::Closed;
                        emitted.push(BreakerEvent::StateTransition {
                            from: CircuitStateKind::HalfOpen,
                            to: CircuitStateKind::Closed,
                            manual: false,
                        });
                    } else {
                        let next_cycle = cycle_transition_count + 1;
                        inner.state = CircuitState::Open {
                            delay_duration: self.config.delay_strategy.delay_for(next_cycle),
                            start_time_mark: now,
                            cycle_transition_count: next_cycle,
                        };
                        emitted.push(BreakerEvent::StateTransition {
                            from: CircuitStateKind::HalfOpen,
                            to: CircuitStateKind::Open,
                            manual: false,
                        });
                    }
                } else {
                    inner.state =
                        CircuitState::HalfOpen { calls_attempted, start_time_mark, cycle_transition_count };
                }
            }
            CircuitState::Open { .. } => {
                // Defensive: execute() never forwards a result for an Open breaker.
            }
        }

        emitted
    }

    fn manual_transition(&self, target: CircuitStateKind) -> Vec<BreakerEvent> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        let from = inner.state.kind();
        if from == target {
            return Vec::new();
        }

        inner.state = match target {
            CircuitStateKind::Closed => CircuitState::Closed,
            CircuitStateKind::Open => {
                let cycle_transition_count = match inner.state {
                    CircuitState::HalfOpen { cycle_transition_count, .. } => cycle_transition_count + 1,
                    CircuitState::Open { cycle_transition_count, .. } => cycle_transition_count,
                    CircuitState::Closed => 1,
                };
                CircuitState::Open {
                    delay_duration: self.config.delay_strategy.delay_for(cycle_transition_count),
                    start_time_mark: now,
                    cycle_transition_count,
                }
            }
            CircuitStateKind::HalfOpen => {
                let cycle_transition_count = match inner.state {
                    CircuitState::Open { cycle_transition_count, .. } => cycle_transition_count,
                    _ => 1,
                };
                let start_time_mark =
                    if self.config.max_wait_in_half_open.is_zero() { None } else { Some(now) };
                CircuitState::HalfOpen { calls_attempted: 0, start_time_mark, cycle_transition_count }
            }
        };

        vec![BreakerEvent::StateTransition { from, to: target, manual: true }]
    }
}

/// Builder for [`CircuitBreaker`].
pub struct CircuitBreakerBuilder<T, E> {
    failure_rate_threshold: f64,
    window_capacity: usize,
    window_minimum_throughput: usize,
    permitted_calls_in_half_open: u64,
    max_wait_in_half_open: Duration,
    delay_strategy: DelayStrategy,
    record_exception: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    record_result: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    clock: Arc<dyn Clock>,
}

impl<T, E> CircuitBreakerBuilder<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            window_capacity: 100,
            window_minimum_throughput: 10,
            permitted_calls_in_half_open: 10,
            max_wait_in_half_open: Duration::ZERO,
            delay_strategy: DelayStrategy::constant(Duration::from_secs(60)).expect("60s is > 0"),
            record_exception: Arc::new(|_| true),
            record_result: Arc::new(|_| false),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn failure_rate_threshold(mut self, threshold: f64) -> Result<Self, ConfigError> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::InvalidFailureRateThreshold(threshold));
        }
        self.failure_rate_threshold = threshold;
        Ok(self)
    }

    pub fn sliding_window(mut self, capacity: usize, minimum_throughput: usize) -> Result<Self, ConfigError> {
        if capacity < 1 {
            return Err(ConfigError::InvalidWindowCapacity);
        }
        if minimum_throughput < 1 {
            return Err(ConfigError::InvalidMinimumThroughput);
        }
        self.window_capacity = capacity;
        self.window_minimum_throughput = minimum_throughput;
        Ok(self)
    }

    pub fn permitted_calls_in_half_open(mut self, n: u64) -> Result<Self, ConfigError> {
        if n < 1 {
            return Err(ConfigError::InvalidPermittedCallsInHalfOpen);
        }
        self.permitted_calls_in_half_open = n;
        Ok(self)
    }

    /// `Duration::ZERO` means wait indefinitely in `HalfOpen`.
    pub fn max_wait_in_half_open(mut self, duration: Duration) -> Self {
        self.max_wait_in_half_open = duration;
        self
    }

    pub fn delay_strategy(mut self, strategy: DelayStrategy) -> Self {
        self.delay_strategy = strategy;
        self
    }

    pub fn record_exception<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.record_exception = Arc::new(predicate);
        self
    }

    pub fn record_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.record_result = Arc::new(predicate);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> CircuitBreaker<T, E> {
        CircuitBreaker {
            config: Config {
                failure_rate_threshold: self.failure_rate_threshold,
                permitted_calls_in_half_open: self.permitted_calls_in_half_open,
                max_wait_in_half_open: self.max_wait_in_half_open,
                delay_strategy: self.delay_strategy,
                record_exception: self.record_exception,
                record_result: self.record_result,
            },
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: SlidingWindow::new(self.window_capacity, self.window_minimum_throughput),
            }),
            clock: self.clock,
            events: EventBus::new(),
        }
    }
}

impl<T, E> Default for CircuitBreakerBuilder<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError;
    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error")
        }
    }
    impl std::error::Error for TestError {}

    async fn ok() -> Result<i32, TestError> {
        Ok(1)
    }
    async fn fail() -> Result<i32, TestError> {
        Err(TestError)
    }

    #[tokio::test]
    async fn opens_at_threshold_seed_scenario() {
        // threshold=0.5, window 10/10, pattern [F,S,F,S,F,S,F,S,F,S]
        let breaker: CircuitBreaker<i32, TestError> = CircuitBreaker::builder()
            .failure_rate_threshold(0.5)
            .unwrap()
            .sliding_window(10, 10)
            .unwrap()
            .build();

        let pattern = [false, true, false, true, false, true, false, true, false, true];
        for is_success in pattern {
            if is_success {
                let _ = breaker.execute(ok).await;
            } else {
                let _ = breaker.execute(fail).await;
            }
        }
        assert_eq!(breaker.current_state(), CircuitStateKind::Open);

        let result = breaker.execute(ok).await;
        assert!(matches!(result, Err(ResilienceError::CallNotPermitted { state: CircuitStateKind::Open })));
    }

    #[tokio::test]
    async fn cycle_escalation_seed_scenario() {
        let clock = Arc::new(ManualClock::new());
        let delay = DelayStrategy::linear(Duration::from_secs(3), 1.0, Duration::from_secs(100)).unwrap();
        let breaker: CircuitBreaker<i32, TestError> = CircuitBreaker::builder()
            .failure_rate_threshold(0.6)
            .unwrap()
            .sliding_window(20, 1)
            .unwrap()
            .permitted_calls_in_half_open(3)
            .unwrap()
            .delay_strategy(delay)
            .with_clock(clock.clone())
            .build();

        // Force open: first failure already exceeds the 0.6 threshold.
        let _ = breaker.execute(fail).await;
        assert_eq!(breaker.current_state(), CircuitStateKind::Open);

        // First open's delay is 3s (cycle_transition_count == 1).
        clock.advance(3_000);
        assert_eq!(breaker.current_state(), CircuitStateKind::HalfOpen);

        // Fail all 3 half-open trial calls -> reopen; cycle_transition_count now 2 -> delay 6s.
        let _ = breaker.execute(fail).await;
        let _ = breaker.execute(fail).await;
        let _ = breaker.execute(fail).await;
        assert_eq!(breaker.current_state(), CircuitStateKind::Open);

        clock.advance(3_000);
        // Only 3s elapsed since the second open started; 6s required, so still Open.
        assert_eq!(breaker.current_state(), CircuitStateKind::Open);

        clock.advance(3_000);
        assert_eq!(breaker.current_state(), CircuitStateKind::HalfOpen);

        // Succeed all 3 trial calls: diluted failure rate now 4/7 < 0.6 -> Closed, ending the cycle.
        let _ = breaker.execute(ok).await;
        let _ = breaker.execute(ok).await;
        let _ = breaker.execute(ok).await;
        assert_eq!(breaker.current_state(), CircuitStateKind::Closed);

        // Next time it opens, cycle_transition_count restarts at 1 -> delay 3s again.
        let _ = breaker.execute(fail).await;
        assert_eq!(breaker.current_state(), CircuitStateKind::Open);
        clock.advance(3_000);
        assert_eq!(breaker.current_state(), CircuitStateKind::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_closed_preserves_window_by_default() {
        let clock = Arc::new(ManualClock::new());
        let breaker: CircuitBreaker<i32, TestError> = CircuitBreaker::builder()
            .failure_rate_threshold(0.9)
            .unwrap()
            .sliding_window(4, 1)
            .unwrap()
            .permitted_calls_in_half_open(1)
            .unwrap()
            .delay_strategy(DelayStrategy::constant(Duration::from_secs(1)).unwrap())
            .with_clock(clock.clone())
            .build();

        // min_throughput=1, threshold=0.9: the very first failure already opens the breaker.
        let _ = breaker.execute(fail).await;
        assert_eq!(breaker.current_state(), CircuitStateKind::Open);

        clock.advance(1_000);
        assert_eq!(breaker.current_state(), CircuitStateKind::HalfOpen);
        // Window still holds the earlier failure (not cleared): [failure, success] -> rate 0.5,
        // below the 0.9 threshold, so the single half-open trial call closes the breaker.
        let _ = breaker.execute(ok).await;
        assert_eq!(breaker.current_state(), CircuitStateKind::Closed);
    }

    #[tokio::test]
    async fn reset_clears_window_and_returns_to_closed() {
        let breaker: CircuitBreaker<i32, TestError> = CircuitBreaker::builder()
            .failure_rate_threshold(0.5)
            .unwrap()
            .sliding_window(2, 1)
            .unwrap()
            .build();

        let _ = breaker.execute(fail).await;
        let _ = breaker.execute(fail).await;
        assert_eq!(breaker.current_state(), CircuitStateKind::Open);

        breaker.reset();
        assert_eq!(breaker.current_state(), CircuitStateKind::Closed);
    }

    #[tokio::test]
    async fn manual_transition_to_closed_is_idempotent() {
        let breaker: CircuitBreaker<i32, TestError> = CircuitBreaker::builder().build();
        let mut rx = breaker.subscribe();
        breaker.transition_to_closed();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn builder_validates_threshold_range() {
        let result = CircuitBreakerBuilder::<i32, TestError>::new().failure_rate_threshold(0.0);
        assert!(result.is_err());
        let result = CircuitBreakerBuilder::<i32, TestError>::new().failure_rate_threshold(1.5);
        assert!(result.is_err());
    }

    #[test]
    fn builder_validates_window() {
        let result = CircuitBreakerBuilder::<i32, TestError>::new().sliding_window(0, 1);
        assert!(result.is_err());
        let result = CircuitBreakerBuilder::<i32, TestError>::new().sliding_window(1, 0);
        assert!(result.is_err());
    }
}
