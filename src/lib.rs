#![forbid(unsafe_code)]

//! # triad
//!
//! Composable resilience primitives for async Rust: retry, circuit breaker, and rate
//! limiter engines, each usable alone or layered together by simply nesting `execute` calls.
//!
//! ## Features
//!
//! - **Retry** with pluggable delay strategies (constant, linear, exponential, custom) and
//!   jitter.
//! - **Circuit breaker** with count-based sliding-window failure rate, `HalfOpen` trial calls,
//!   and cycle-aware delay escalation on repeated re-opens.
//! - **Rate limiter** with three interchangeable algorithms (fixed window, sliding window,
//!   token bucket), FIFO queueing for callers over capacity, and a keyed registry for
//!   per-tenant/per-key permit pools.
//! - Deterministic testing: every engine takes an injectable [`Clock`] and/or [`Sleeper`], so
//!   time-dependent behavior is testable without real delays.
//! - Best-effort telemetry via an [`EventBus`] per engine, plus a `tower::Service`-shaped
//!   [`TelemetrySink`] trait for composable sinks.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use triad::{DelayStrategy, ResilienceError, RetryPolicy};
//!
//! async fn flaky_operation(
//!     attempts: Arc<AtomicUsize>,
//! ) -> Result<(), std::io::Error> {
//!     let n = attempts.fetch_add(1, Ordering::Relaxed);
//!     if n < 2 {
//!         Err(std::io::Error::new(std::io::ErrorKind::Other, "transient failure"))
//!     } else {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError<std::io::Error>> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .unwrap()
//!         .delay_strategy(DelayStrategy::exponential(
//!             Duration::from_millis(200),
//!             2.0,
//!             Duration::from_secs(5),
//!         ).unwrap())
//!         .build();
//!
//!     retry.execute(|| flaky_operation(attempts.clone())).await?;
//!     Ok(())
//! }
//! ```

mod adaptive;
mod circuit_breaker;
mod clock;
mod delay;
mod error;
mod event;
mod rate_limiter;
mod retry;
mod sleeper;
mod waiter_queue;
mod window;

pub use adaptive::Adaptive;
pub use circuit_breaker::{BreakerEvent, CircuitBreaker, CircuitBreakerBuilder};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use delay::{DelayStrategy, Jitter};
pub use error::{CircuitStateKind, ConfigError, ResilienceError, MAX_RETRY_FAILURES};
pub use event::{EventBus, LogSink, MemorySink, NullSink, TelemetrySink};
pub use rate_limiter::{KeyedRateLimiter, RateLimiter, RateLimiterBuilder, RateLimiterEvent};
pub use retry::{RetryEvent, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use waiter_queue::{Handle as WaiterHandle, WaiterQueue};
pub use window::SlidingWindow;

pub mod prelude;
