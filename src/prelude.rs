//! Convenience re-exports: `use triad::prelude::*;` for the common path through all three
//! engines without naming each module.

pub use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerBuilder};
pub use crate::clock::{Clock, ManualClock, MonotonicClock};
pub use crate::delay::{DelayStrategy, Jitter};
pub use crate::error::{CircuitStateKind, ConfigError, ResilienceError};
pub use crate::rate_limiter::{KeyedRateLimiter, RateLimiter};
pub use crate::retry::RetryPolicy;
pub use crate::sleeper::{Sleeper, TokioSleeper};
