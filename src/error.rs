//! Shared error taxonomy for the retry, circuit breaker, and rate limiter engines.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Cap the number of stored failures inside [`ResilienceError::MaxRetriesExceeded`] to avoid
/// unbounded growth on a pathological `max_attempts`.
pub const MAX_RETRY_FAILURES: usize = 10;

/// A lightweight, `Clone`-able description of the breaker state at rejection time.
///
/// Kept separate from the full internal `CircuitState` so call sites do not need `E: Clone`
/// just to inspect why a call was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Error surfaced at the boundary of any of the three engines.
///
/// `E` is the operation's own error type, carried unchanged inside [`Self::Inner`] and
/// collected inside [`Self::MaxRetriesExceeded`].
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The underlying operation failed and the failure propagated (untouched, or after retries
    /// were exhausted and the configured exception handler rethrows).
    Inner(E),
    /// The retry engine gave up after `attempts` attempts. `failures` holds up to
    /// [`MAX_RETRY_FAILURES`] of the most recent recorded failures, oldest dropped first.
    MaxRetriesExceeded { attempts: usize, failures: Vec<E> },
    /// The circuit breaker rejected the call: it was `Open`, or `HalfOpen` with its trial-call
    /// budget exhausted.
    CallNotPermitted { state: CircuitStateKind },
    /// The rate limiter rejected the acquisition. `retry_after` is an algorithm-specific hint,
    /// not a guarantee.
    RateLimited { retry_after: Duration },
}

impl<E: Clone> Clone for ResilienceError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Inner(e) => Self::Inner(e.clone()),
            Self::MaxRetriesExceeded { attempts, failures } => {
                Self::MaxRetriesExceeded { attempts: *attempts, failures: failures.clone() }
            }
            Self::CallNotPermitted { state } => Self::CallNotPermitted { state: *state },
            Self::RateLimited { retry_after } => Self::RateLimited { retry_after: *retry_after },
        }
    }
}

impl<E: PartialEq> PartialEq for ResilienceError<E> {
    fn eq(&self, other: &Self) -> bool {
        use ResilienceError::*;
        match (self, other) {
            (Inner(a), Inner(b)) => a == b,
            (
                MaxRetriesExceeded { attempts: a1, failures: f1 },
                MaxRetriesExceeded { attempts: a2, failures: f2 },
            ) => a1 == a2 && f1 == f2,
            (CallNotPermitted { state: a }, CallNotPermitted { state: b }) => a == b,
            (RateLimited { retry_after: a }, RateLimited { retry_after: b }) => a == b,
            _ => false,
        }
    }
}

impl<E: Eq> Eq for ResilienceError<E> {}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inner(e) => write!(f, "{}", e),
            Self::MaxRetriesExceeded { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "retry exhausted after {} attempts ({} recorded failures), last error: {}",
                    attempts,
                    failures.len(),
                    last
                )
            }
            Self::CallNotPermitted { state } => {
                write!(f, "circuit breaker call not permitted (state: {})", state)
            }
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {:?}", retry_after)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::MaxRetriesExceeded { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    pub fn is_max_retries_exceeded(&self) -> bool {
        matches!(self, Self::MaxRetriesExceeded { .. })
    }

    pub fn is_call_not_permitted(&self) -> bool {
        matches!(self, Self::CallNotPermitted { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner_mut(&mut self) -> Option<&mut E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Failures recorded by an exhausted retry loop, if this is that variant.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::MaxRetriesExceeded { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }
}

/// Programmer errors caught at configuration time: invalid thresholds, invalid delay
/// parameters, and similar. Builders fail fast with this rather than panicking or deferring
/// the problem to the first call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("delay parameter invalid: {0}")]
    InvalidDelay(String),

    #[error("failure_rate_threshold must be in (0, 1], got {0}")]
    InvalidFailureRateThreshold(f64),

    #[error("sliding window capacity must be at least 1")]
    InvalidWindowCapacity,

    #[error("sliding window minimum_throughput must be at least 1")]
    InvalidMinimumThroughput,

    #[error("permitted_calls_in_half_open must be at least 1")]
    InvalidPermittedCallsInHalfOpen,

    #[error("total_permits must be at least 1")]
    InvalidTotalPermits,

    #[error("replenishment_period must be greater than zero")]
    InvalidReplenishmentPeriod,

    #[error("sliding window segment count must be at least 1")]
    InvalidSegmentCount,
}
