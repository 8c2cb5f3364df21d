//! Retry engine (C5): a loop-and-delay controller around a user operation.
//!
//! Implements the algorithm in full: attempt 1 is the initial call; `should_retry_on_result`
//! and `should_retry_on_exception` independently decide whether a given outcome triggers
//! another attempt; `before_attempt` runs immediately before every call including the first;
//! the delay strategy is consulted between attempts, not before the first one.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::delay::DelayStrategy;
use crate::error::{ConfigError, ResilienceError, MAX_RETRY_FAILURES};
use crate::event::EventBus;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Events emitted by the retry engine, in the order named by the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    Attempt { attempt: u64 },
    Success,
    /// The operation's own error (or a retry-rejecting result) exhausted `max_attempts`.
    Error { attempts: u64 },
    /// `should_retry_on_exception` rejected the error on the very attempt it occurred.
    IgnoredError,
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attempt { attempt } => write!(f, "retry attempt {attempt}"),
            Self::Success => write!(f, "retry succeeded"),
            Self::Error { attempts } => write!(f, "retry exhausted after {attempts} attempts"),
            Self::IgnoredError => write!(f, "retry ignored non-retryable error"),
        }
    }
}

type ShouldRetryException<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type ShouldRetryResult<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type BeforeAttempt = Arc<dyn Fn(u64) + Send + Sync>;
type ExceptionHandler<E> = Arc<dyn Fn(&ResilienceError<E>) + Send + Sync>;

/// A configured retry policy. Construct via [`RetryPolicy::builder`].
pub struct RetryPolicy<T, E> {
    max_attempts: u64,
    delay_strategy: DelayStrategy,
    should_retry_on_exception: ShouldRetryException<E>,
    should_retry_on_result: ShouldRetryResult<T>,
    before_attempt: BeforeAttempt,
    exception_handler: ExceptionHandler<E>,
    sleeper: Arc<dyn Sleeper>,
    events: EventBus<RetryEvent>,
}

impl<T, E> fmt::Debug for RetryPolicy<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay_strategy", &self.delay_strategy)
            .finish()
    }
}

impl<T, E> RetryPolicy<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<T, E> {
        RetryPolicyBuilder::new()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RetryEvent> {
        self.events.subscribe()
    }

    /// Run `operation` to completion per the retry algorithm in the data model. `operation` is
    /// re-invoked fresh on every attempt.
    pub async fn execute<Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut attempt: u64 = 1;
        let mut failures: Vec<E> = Vec::new();

        loop {
            (self.before_attempt)(attempt);

            match operation().await {
                Ok(result) => {
                    if !(self.should_retry_on_result)(&result) {
                        if attempt > 1 {
                            self.events.emit(RetryEvent::Success);
                        }
                        return Ok(result);
                    }
                    if attempt < self.max_attempts {
                        attempt += 1;
                        self.events.emit(RetryEvent::Attempt { attempt });
                        self.wait(attempt).await;
                        continue;
                    }
                    self.events.emit(RetryEvent::Error { attempts: attempt });
                    let err = ResilienceError::MaxRetriesExceeded {
                        attempts: attempt as usize,
                        failures: std::mem::take(&mut failures),
                    };
                    (self.exception_handler)(&err);
                    return Err(err);
                }
                Err(e) => {
                    if !(self.should_retry_on_exception)(&e) {
                        self.events.emit(RetryEvent::IgnoredError);
                        let err = ResilienceError::Inner(e);
                        (self.exception_handler)(&err);
                        return Err(err);
                    }
                    push_capped(&mut failures, e);
                    if attempt < self.max_attempts {
                        attempt += 1;
                        self.events.emit(RetryEvent::Attempt { attempt });
                        self.wait(attempt).await;
                        continue;
                    }
                    self.events.emit(RetryEvent::Error { attempts: attempt });
                    let err = ResilienceError::MaxRetriesExceeded {
                        attempts: attempt as usize,
                        failures,
                    };
                    (self.exception_handler)(&err);
                    return Err(err);
                }
            }
        }
    }

    async fn wait(&self, attempt: u64) {
        let delay = self.delay_strategy.delay_for(attempt - 1);
        if delay > Duration::ZERO {
            self.sleeper.sleep(delay).await;
        }
    }
}

/// Push a failure, dropping the oldest once [`MAX_RETRY_FAILURES`] is exceeded.
fn push_capped<E>(failures: &mut Vec<E>, e: E) {
    failures.push(e);
    if failures.len() > MAX_RETRY_FAILURES {
        failures.remove(0);
    }
}

/// Builder for [`RetryPolicy`]. All setters are infallible except [`Self::max_attempts`]; the
/// result is always a valid, immediately usable policy.
pub struct RetryPolicyBuilder<T, E> {
    max_attempts: u64,
    delay_strategy: DelayStrategy,
    should_retry_on_exception: ShouldRetryException<E>,
    should_retry_on_result: ShouldRetryResult<T>,
    before_attempt: BeforeAttempt,
    exception_handler: ExceptionHandler<E>,
    sleeper: Arc<dyn Sleeper>,
}

impl<T, E> RetryPolicyBuilder<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            delay_strategy: DelayStrategy::none(),
            should_retry_on_exception: Arc::new(|_| true),
            should_retry_on_result: Arc::new(|_| false),
            before_attempt: Arc::new(|_| {}),
            exception_handler: Arc::new(|_| {}),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn max_attempts(mut self, n: u64) -> Result<Self, ConfigError> {
        if n == 0 {
            return Err(ConfigError::InvalidMaxAttempts);
        }
        self.max_attempts = n;
        Ok(self)
    }

    pub fn delay_strategy(mut self, strategy: DelayStrategy) -> Self {
        self.delay_strategy = strategy;
        self
    }

    pub fn retry_on_exception<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry_on_exception = Arc::new(predicate);
        self
    }

    pub fn retry_on_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.should_retry_on_result = Arc::new(predicate);
        self
    }

    pub fn before_attempt<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.before_attempt = Arc::new(callback);
        self
    }

    /// Set a handler invoked (for side effects only, e.g. logging) whenever `execute` is about
    /// to return an error. The handler cannot suppress the error: this engine speaks `Result`,
    /// not exceptions, so "rethrow" is the only outcome — the handler is an observation point,
    /// not a recovery point.
    pub fn exception_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ResilienceError<E>) + Send + Sync + 'static,
    {
        self.exception_handler = Arc::new(handler);
        self
    }

    /// Restore the default no-op handler.
    pub fn disable_exception_handler(mut self) -> Self {
        self.exception_handler = Arc::new(|_| {});
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> RetryPolicy<T, E> {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay_strategy: self.delay_strategy,
            should_retry_on_exception: self.should_retry_on_exception,
            should_retry_on_result: self.should_retry_on_result,
            before_attempt: self.before_attempt,
            exception_handler: self.exception_handler,
            sleeper: self.sleeper,
            events: EventBus::new(),
        }
    }
}

impl<T, E> Default for RetryPolicyBuilder<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
