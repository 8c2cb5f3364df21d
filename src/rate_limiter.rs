//! Rate limiter engine (C4 Semaphore State + C7 Rate Limiter Engine), plus the keyed registry.
//!
//! The permit-accounting algorithm (`RateLimitAlgorithm`) is pure state mutated only under
//! `algorithm`'s lock: replenish, then admit-if-capacity, never suspends. The FIFO waiter
//! queue is the only place a caller suspends, and it always does so with the locks released
//! first — `acquire` drops every guard before awaiting the resume signal, and reacquires only
//! to detach itself on timeout.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, ResilienceError};
use crate::event::EventBus;
use crate::waiter_queue::WaiterQueue;

/// Events emitted by the rate limiter engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimiterEvent {
    Acquired,
    Queued { queue_depth: usize },
    Resumed,
    Rejected { retry_after: Duration },
    TimedOutWaiting { retry_after: Duration },
    Released,
}

impl fmt::Display for RateLimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acquired => write!(f, "rate limiter acquired"),
            Self::Queued { queue_depth } => write!(f, "rate limiter queued (depth={queue_depth})"),
            Self::Resumed => write!(f, "rate limiter resumed from queue"),
            Self::Rejected { retry_after } => write!(f, "rate limiter rejected, retry after {retry_after:?}"),
            Self::TimedOutWaiting { retry_after } => {
                write!(f, "rate limiter timed out waiting, retry after {retry_after:?}")
            }
            Self::Released => write!(f, "rate limiter released a permit"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FixedWindowCounter {
    total_permits: usize,
    period: Duration,
    permits_in_use: usize,
    window_start: u64,
}

impl FixedWindowCounter {
    fn new(total_permits: usize, period: Duration) -> Self {
        Self { total_permits, period, permits_in_use: 0, window_start: 0 }
    }

    fn refresh(&mut self, now: u64) {
        if now.saturating_sub(self.window_start) >= self.period.as_millis() as u64 {
            self.window_start = now;
            self.permits_in_use = 0;
        }
    }

    fn has_capacity(&self, permits: usize) -> bool {
        self.permits_in_use + permits <= self.total_permits
    }

    fn acquire(&mut self, permits: usize) {
        self.permits_in_use += permits;
    }

    fn release(&mut self, permits: usize) {
        self.permits_in_use = self.permits_in_use.saturating_sub(permits);
    }

    fn retry_after(&self, now: u64) -> Duration {
        let elapsed = now.saturating_sub(self.window_start);
        let period_millis = self.period.as_millis() as u64;
        Duration::from_millis(period_millis.saturating_sub(elapsed))
    }
}

/// Weighted estimate of a trailing window using fixed-size segments: the previous segment's
/// count is discounted by how much of it has already slid out of the window. Coarser than a
/// true continuous sliding window, exact at segment boundaries, approximate in between.
#[derive(Debug, Clone)]
struct SlidingWindowCounter {
    total_permits: usize,
    segment_millis: u64,
    current_segment: u64,
    current_count: usize,
    previous_count: usize,
}

impl SlidingWindowCounter {
    fn new(total_permits: usize, period: Duration, segments: u64) -> Self {
        let segment_millis = (period.as_millis() as u64 / segments).max(1);
        Self { total_permits, segment_millis, current_segment: 0, current_count: 0, previous_count: 0 }
    }

    fn refresh(&mut self, now: u64) {
        let segment = now / self.segment_millis;
        if segment == self.current_segment {
            return;
        }
        if segment == self.current_segment + 1 {
            self.previous_count = self.current_count;
        } else {
            self.previous_count = 0;
        }
        self.current_count = 0;
        self.current_segment = segment;
    }

    fn overlap_fraction(&self, now: u64) -> f64 {
        let segment_start = self.current_segment * self.segment_millis;
        let elapsed = (now.saturating_sub(segment_start)) as f64;
        (1.0 - elapsed / self.segment_millis as f64).clamp(0.0, 1.0)
    }

    fn weighted_count(&self, now: u64) -> f64 {
        self.previous_count as f64 * self.overlap_fraction(now) + self.current_count as f64
    }

    fn has_capacity(&self, now: u64, permits: usize) -> bool {
        self.weighted_count(now) + permits as f64 <= self.total_permits as f64
    }

    fn acquire(&mut self, permits: usize) {
        self.current_count += permits;
    }

    fn release(&mut self, permits: usize) {
        self.current_count = self.current_count.saturating_sub(permits);
    }

    fn retry_after(&self) -> Duration {
        Duration::from_millis(self.segment_millis)
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketCounter {
    capacity: f64,
    refill_per_milli: f64,
    tokens: f64,
    last_refill: u64,
}

impl TokenBucketCounter {
    fn new(total_permits: usize, refill_period: Duration) -> Self {
        let capacity = total_permits as f64;
        let refill_per_milli = capacity / refill_period.as_millis().max(1) as f64;
        Self { capacity, refill_per_milli, tokens: capacity, last_refill: 0 }
    }

    fn refresh(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last_refill) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_milli).min(self.capacity);
        self.last_refill = now;
    }

    fn has_capacity(&self, permits: usize) -> bool {
        self.tokens >= permits as f64
    }

    fn acquire(&mut self, permits: usize) {
        self.tokens -= permits as f64;
    }

    fn release(&mut self, permits: usize) {
        self.tokens = (self.tokens + permits as f64).min(self.capacity);
    }

    fn retry_after(&self, permits: usize) -> Duration {
        if self.tokens >= permits as f64 {
            return Duration::ZERO;
        }
        let needed = (permits as f64 - self.tokens) / self.refill_per_milli;
        Duration::from_millis(needed.ceil() as u64)
    }
}

#[derive(Debug, Clone)]
enum RateLimitAlgorithm {
    FixedWindow(FixedWindowCounter),
    SlidingWindow(SlidingWindowCounter),
    TokenBucket(TokenBucketCounter),
}

impl RateLimitAlgorithm {
    fn refresh(&mut self, now: u64) {
        match self {
            Self::FixedWindow(a) => a.refresh(now),
            Self::SlidingWindow(a) => a.refresh(now),
            Self::TokenBucket(a) => a.refresh(now),
        }
    }

    fn has_capacity(&self, now: u64, permits: usize) -> bool {
        match self {
            Self::FixedWindow(a) => a.has_capacity(permits),
            Self::SlidingWindow(a) => a.has_capacity(now, permits),
            Self::TokenBucket(a) => a.has_capacity(permits),
        }
    }

    fn acquire(&mut self, permits: usize) {
        match self {
            Self::FixedWindow(a) => a.acquire(permits),
            Self::SlidingWindow(a) => a.acquire(permits),
            Self::TokenBucket(a) => a.acquire(permits),
        }
    }

    fn release(&mut self, permits: usize) {
        match self {
            Self::FixedWindow(a) => a.release(permits),
            Self::SlidingWindow(a) => a.release(permits),
            Self::TokenBucket(a) => a.release(permits),
        }
    }

    fn retry_after(&self, now: u64, permits: usize) -> Duration {
        match self {
            Self::FixedWindow(a) => a.retry_after(now),
            Self::SlidingWindow(a) => a.retry_after(),
            Self::TokenBucket(a) => a.retry_after(permits),
        }
    }
}

/// A suspended caller's request, carried in the queue so a later release can tell whether it
/// fits before dequeuing it.
struct Waiter {
    permits_requested: usize,
    sender: oneshot::Sender<()>,
}

struct Inner {
    algorithm: RateLimitAlgorithm,
    queue: WaiterQueue<Waiter>,
}

/// A configured rate limiter. Construct via [`RateLimiter::fixed_window`],
/// [`RateLimiter::sliding_window`], or [`RateLimiter::token_bucket`].
pub struct RateLimiter {
    inner: Mutex<Inner>,
    queue_length: usize,
    base_acquisition_timeout: Duration,
    clock: Arc<dyn Clock>,
    on_rejected: Arc<dyn Fn(Duration) + Send + Sync>,
    events: EventBus<RateLimiterEvent>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter").field("queue_length", &self.queue_length).finish()
    }
}

impl RateLimiter {
    pub fn fixed_window(total_permits: usize, period: Duration) -> Result<RateLimiterBuilder, ConfigError> {
        if total_permits < 1 {
            return Err(ConfigError::InvalidTotalPermits);
        }
        if period.is_zero() {
            return Err(ConfigError::InvalidReplenishmentPeriod);
        }
        Ok(RateLimiterBuilder::from_algorithm(RateLimitAlgorithm::FixedWindow(FixedWindowCounter::new(
            total_permits,
            period,
        ))))
    }

    pub fn sliding_window(
        total_permits: usize,
        period: Duration,
        segments: u64,
    ) -> Result<RateLimiterBuilder, ConfigError> {
        if total_permits < 1 {
            return Err(ConfigError::InvalidTotalPermits);
        }
        if period.is_zero() {
            return Err(ConfigError::InvalidReplenishmentPeriod);
        }
        if segments < 1 {
            return Err(ConfigError::InvalidSegmentCount);
        }
        Ok(RateLimiterBuilder::from_algorithm(RateLimitAlgorithm::SlidingWindow(SlidingWindowCounter::new(
            total_permits,
            period,
            segments,
        ))))
    }

    pub fn token_bucket(total_permits: usize, refill_period: Duration) -> Result<RateLimiterBuilder, ConfigError> {
        if total_permits < 1 {
            return Err(ConfigError::InvalidTotalPermits);
        }
        if refill_period.is_zero() {
            return Err(ConfigError::InvalidReplenishmentPeriod);
        }
        Ok(RateLimiterBuilder::from_algorithm(RateLimitAlgorithm::TokenBucket(TokenBucketCounter::new(
            total_permits,
            refill_period,
        ))))
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RateLimiterEvent> {
        self.events.subscribe()
    }

    fn queue_depth(&self) -> usize {
        self.inner.lock().expect("rate limiter mutex poisoned").queue.len()
    }

    /// Admit immediately, queue FIFO-style behind other waiters, or reject with a `retry_after`
    /// hint. Never holds a lock while suspended. `timeout` overrides the builder's
    /// `base_acquisition_timeout` for this call only; `None` falls back to it.
    pub async fn acquire(&self, permits: usize, timeout: Option<Duration>) -> Result<(), Duration> {
        let now = self.clock.now_millis();
        let timeout = timeout.unwrap_or(self.base_acquisition_timeout);

        enum Outcome {
            Granted,
            Enqueued(oneshot::Receiver<()>, crate::waiter_queue::Handle),
            Rejected(Duration),
        }

        let outcome = {
            let mut inner = self.inner.lock().expect("rate limiter mutex poisoned");
            inner.algorithm.refresh(now);
            if inner.algorithm.has_capacity(now, permits) {
                inner.algorithm.acquire(permits);
                Outcome::Granted
            } else if inner.queue.len() < self.queue_length {
                let (tx, rx) = oneshot::channel();
                let handle = inner.queue.push_back(Waiter { permits_requested: permits, sender: tx });
                Outcome::Enqueued(rx, handle)
            } else {
                Outcome::Rejected(inner.algorithm.retry_after(now, permits))
            }
        };

        match outcome {
            Outcome::Granted => {
                self.emit(RateLimiterEvent::Acquired);
                Ok(())
            }
            Outcome::Rejected(retry_after) => {
                self.emit(RateLimiterEvent::Rejected { retry_after });
                (self.on_rejected)(retry_after);
                Err(retry_after)
            }
            Outcome::Enqueued(rx, handle) => {
                self.emit(RateLimiterEvent::Queued { queue_depth: self.queue_depth() });

                let resumed = if timeout.is_zero() {
                    rx.await.is_ok()
                } else {
                    matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
                };

                if resumed {
                    self.emit(RateLimiterEvent::Resumed);
                    return Ok(());
                }

                // Timed out (or the sender was dropped without sending, which cannot happen in
                // this engine). Detach ourselves if `release` hasn't already popped us.
                let now = self.clock.now_millis();
                let retry_after = {
                    let mut inner = self.inner.lock().expect("rate limiter mutex poisoned");
                    inner.queue.remove(handle);
                    inner.algorithm.refresh(now);
                    inner.algorithm.retry_after(now, permits)
                };
                self.emit(RateLimiterEvent::TimedOutWaiting { retry_after });
                (self.on_rejected)(retry_after);
                Err(retry_after)
            }
        }
    }

    /// Return `permits`. Walks the queue head-first, granting every waiter whose request now
    /// fits; stops the moment the head waiter doesn't fit, even if a later, smaller waiter
    /// would (strict FIFO — a later waiter is never resumed ahead of an earlier one).
    pub fn release(&self, permits: usize) {
        let resumed = {
            let mut inner = self.inner.lock().expect("rate limiter mutex poisoned");
            inner.algorithm.release(permits);
            let now = self.clock.now_millis();

            let mut resumed = Vec::new();
            while let Some(permits_requested) = inner.queue.peek_front().map(|w| w.permits_requested) {
                if !inner.algorithm.has_capacity(now, permits_requested) {
                    break;
                }
                let (_, waiter) = inner.queue.pop_front().expect("peeked head must still be present");
                inner.algorithm.acquire(waiter.permits_requested);
                resumed.push(waiter.sender);
            }
            resumed
        };
        for tx in resumed {
            let _ = tx.send(());
        }
        self.emit(RateLimiterEvent::Released);
    }

    /// Acquire `permits`, run `operation`, then release them — regardless of whether it
    /// succeeded. `timeout` overrides the builder's `base_acquisition_timeout` for this call.
    pub async fn call<Fut, Op, T, E>(
        &self,
        permits: usize,
        timeout: Option<Duration>,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.acquire(permits, timeout).await.map_err(|retry_after| ResilienceError::RateLimited { retry_after })?;
        let result = operation().await;
        self.release(permits);
        result.map_err(ResilienceError::Inner)
    }

    fn emit(&self, event: RateLimiterEvent) {
        if let RateLimiterEvent::Rejected { retry_after } | RateLimiterEvent::TimedOutWaiting { retry_after } = event
        {
            tracing::debug!(?retry_after, "rate limiter rejected a call");
        }
        self.events.emit(event);
    }
}

/// Builder for [`RateLimiter`], obtained from [`RateLimiter::fixed_window`] and siblings.
pub struct RateLimiterBuilder {
    algorithm: RateLimitAlgorithm,
    queue_length: usize,
    base_acquisition_timeout: Duration,
    clock: Arc<dyn Clock>,
    on_rejected: Arc<dyn Fn(Duration) + Send + Sync>,
}

impl RateLimiterBuilder {
    fn from_algorithm(algorithm: RateLimitAlgorithm) -> Self {
        Self {
            algorithm,
            queue_length: 0,
            base_acquisition_timeout: Duration::ZERO,
            clock: Arc::new(MonotonicClock::default()),
            on_rejected: Arc::new(|_| {}),
        }
    }

    /// Maximum number of callers that may suspend waiting for a permit. `0` (the default)
    /// means a caller is rejected immediately rather than queued.
    pub fn queue_length(mut self, n: usize) -> Self {
        self.queue_length = n;
        self
    }

    /// Default timeout applied to a queued acquisition unless a call passes its own via
    /// [`RateLimiter::acquire`]'s `timeout` argument. `Duration::ZERO` (the default) means a
    /// queued caller waits indefinitely.
    pub fn base_acquisition_timeout(mut self, duration: Duration) -> Self {
        self.base_acquisition_timeout = duration;
        self
    }

    /// Runs on every rejection (synchronous or timed-out), before the `retry_after` is
    /// returned to the caller. The default does nothing; rejection always still propagates as
    /// `Err`, this is a hook, not a recovery path.
    pub fn on_rejected<F>(mut self, handler: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.on_rejected = Arc::new(handler);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter {
            inner: Mutex::new(Inner { algorithm: self.algorithm, queue: WaiterQueue::new() }),
            queue_length: self.queue_length,
            base_acquisition_timeout: self.base_acquisition_timeout,
            clock: self.clock,
            on_rejected: self.on_rejected,
            events: EventBus::new(),
        }
    }
}

/// A registry of independent rate limiters, one per key, built lazily from a shared template.
/// Each key's limiter has its own permit pool — there is no cross-key sharing of capacity.
pub struct KeyedRateLimiter<K> {
    factory: Arc<dyn Fn() -> RateLimiterBuilder + Send + Sync>,
    limiters: Mutex<HashMap<K, Arc<RateLimiter>>>,
}

impl<K> fmt::Debug for KeyedRateLimiter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedRateLimiter")
            .field("keys", &self.limiters.lock().expect("keyed rate limiter mutex poisoned").len())
            .finish()
    }
}

impl<K: Eq + Hash + Clone> KeyedRateLimiter<K> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> RateLimiterBuilder + Send + Sync + 'static,
    {
        Self { factory: Arc::new(factory), limiters: Mutex::new(HashMap::new()) }
    }

    /// Lazily builds the limiter for `key` under a single creation lock; subsequent calls with
    /// the same key reuse the same instance and permit pool.
    pub fn get_or_create(&self, key: K) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().expect("keyed rate limiter mutex poisoned");
        Arc::clone(limiters.entry(key).or_insert_with(|| Arc::new((self.factory)().build())))
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().expect("keyed rate limiter mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn fixed_window_rejects_with_accurate_retry_after_seed_scenario() {
        // total=1, period=5s, queue_length=0: acquire at t=0, then again at t=1s -> rejected
        // with retry_after ~= 4s.
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::fixed_window(1, Duration::from_secs(5))
            .unwrap()
            .with_clock(clock.clone())
            .build();

        assert!(limiter.acquire(1, None).await.is_ok());

        clock.advance(1_000);
        let err = limiter.acquire(1, None).await.unwrap_err();
        let diff = err.as_millis().abs_diff(4_000u128);
        assert!(diff <= 250u128, "expected retry_after near 4s, got {err:?}");
    }

    #[tokio::test]
    async fn fixed_window_admits_again_after_period_rolls_over() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::fixed_window(1, Duration::from_secs(5))
            .unwrap()
            .with_clock(clock.clone())
            .build();

        assert!(limiter.acquire(1, None).await.is_ok());
        assert!(limiter.acquire(1, None).await.is_err());

        clock.advance(5_000);
        assert!(limiter.acquire(1, None).await.is_ok());
    }

    #[tokio::test]
    async fn fifo_queueing_seed_scenario() {
        // total_permits=1, queue_length=2, a period long enough that it never rolls over
        // during the test: release() is the only way permits come back.
        let limiter = Arc::new(
            RateLimiter::fixed_window(1, Duration::from_secs(3600)).unwrap().queue_length(2).build(),
        );

        assert!(limiter.acquire(1, None).await.is_ok()); // A admitted immediately

        let order = Arc::new(StdMutex::new(Vec::new()));

        let limiter_b = limiter.clone();
        let order_b = order.clone();
        let b = tokio::spawn(async move {
            limiter_b.acquire(1, None).await.unwrap();
            order_b.lock().unwrap().push("b");
        });
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let limiter_c = limiter.clone();
        let order_c = order.clone();
        let c = tokio::spawn(async move {
            limiter_c.acquire(1, None).await.unwrap();
            order_c.lock().unwrap().push("c");
        });
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert_eq!(limiter.queue_depth(), 2);

        limiter.release(1); // frees A's permit -> resumes B
        b.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["b"]);

        limiter.release(1); // frees B's permit -> resumes C
        c.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn queue_full_rejects_synchronously() {
        let limiter = RateLimiter::fixed_window(1, Duration::from_secs(3600)).unwrap().queue_length(0).build();
        assert!(limiter.acquire(1, None).await.is_ok());
        assert!(limiter.acquire(1, None).await.is_err());
    }

    #[tokio::test]
    async fn timed_out_waiter_detaches_and_does_not_block_later_release() {
        let limiter = Arc::new(
            RateLimiter::fixed_window(1, Duration::from_secs(3600))
                .unwrap()
                .queue_length(1)
                .base_acquisition_timeout(Duration::from_millis(20))
                .build(),
        );
        assert!(limiter.acquire(1, None).await.is_ok());

        let err = limiter.acquire(1, None).await.unwrap_err();
        assert!(err <= Duration::from_secs(3600));
        assert_eq!(limiter.queue_depth(), 0);

        limiter.release(1);
        assert!(limiter.acquire(1, None).await.is_ok());
    }

    #[tokio::test]
    async fn per_call_timeout_overrides_base_acquisition_timeout() {
        // base_acquisition_timeout left at its default (wait indefinitely); this call supplies
        // its own short timeout instead.
        let limiter = Arc::new(
            RateLimiter::fixed_window(1, Duration::from_secs(3600)).unwrap().queue_length(1).build(),
        );
        assert!(limiter.acquire(1, None).await.is_ok());

        let err = limiter.acquire(1, Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(err <= Duration::from_secs(3600));
        assert_eq!(limiter.queue_depth(), 0);
    }

    #[tokio::test]
    async fn token_bucket_admits_up_to_capacity_then_refills() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::token_bucket(2, Duration::from_secs(2))
            .unwrap()
            .with_clock(clock.clone())
            .build();

        assert!(limiter.acquire(1, None).await.is_ok());
        assert!(limiter.acquire(1, None).await.is_ok());
        assert!(limiter.acquire(1, None).await.is_err());

        // refill rate: 2 tokens / 2000ms = 1 token / 1000ms
        clock.advance(1_000);
        assert!(limiter.acquire(1, None).await.is_ok());
    }

    #[tokio::test]
    async fn multi_permit_request_admits_and_accounts_atomically() {
        let limiter = RateLimiter::token_bucket(5, Duration::from_secs(5)).unwrap().build();

        assert!(limiter.acquire(3, None).await.is_ok());
        // only 2 left; a 3-permit request doesn't fit even though total capacity is 5.
        assert!(limiter.acquire(3, None).await.is_err());
        assert!(limiter.acquire(2, None).await.is_ok());
    }

    #[tokio::test]
    async fn head_waiter_requesting_more_permits_blocks_a_smaller_later_waiter() {
        // total=3, all consumed; A (queued, wants 3) goes first, B (queued, wants 1) behind it.
        // Releasing only 1 permit must not let B jump ahead of A, even though 1 permit would
        // satisfy B's request.
        let limiter = Arc::new(
            RateLimiter::fixed_window(3, Duration::from_secs(3600)).unwrap().queue_length(2).build(),
        );
        assert!(limiter.acquire(3, None).await.is_ok());

        let order = Arc::new(StdMutex::new(Vec::new()));

        let limiter_a = limiter.clone();
        let order_a = order.clone();
        let a = tokio::spawn(async move {
            limiter_a.acquire(3, None).await.unwrap();
            order_a.lock().unwrap().push("a");
        });
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let limiter_b = limiter.clone();
        let order_b = order.clone();
        let b = tokio::spawn(async move {
            limiter_b.acquire(1, None).await.unwrap();
            order_b.lock().unwrap().push("b");
        });
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert_eq!(limiter.queue_depth(), 2);

        limiter.release(1); // only 1 of 3 permits free: not enough for head waiter A (wants 3)
        tokio::task::yield_now().await;
        assert!(order.lock().unwrap().is_empty(), "B must not be granted ahead of head waiter A");
        assert_eq!(limiter.queue_depth(), 2);

        limiter.release(2); // now 3 are free: A fits and dequeues, taking all 3; B still doesn't
        a.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a"]);
        assert_eq!(limiter.queue_depth(), 1);

        limiter.release(3); // A's permits come back; only now does B fit
        b.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn sliding_window_smooths_across_segment_boundary() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::sliding_window(2, Duration::from_secs(2), 2)
            .unwrap()
            .with_clock(clock.clone())
            .build();

        assert!(limiter.acquire(1, None).await.is_ok());
        assert!(limiter.acquire(1, None).await.is_ok());
        assert!(limiter.acquire(1, None).await.is_err());

        clock.advance(1_000); // exactly one segment forward
        // previous segment's 2 acquires are now fully weighted out of the window only once
        // the second segment also elapses; immediately after rolling, they still count.
        assert!(limiter.acquire(1, None).await.is_err());
    }

    #[tokio::test]
    async fn keyed_rate_limiter_isolates_permit_pools_per_key() {
        let registry: KeyedRateLimiter<&'static str> =
            KeyedRateLimiter::new(|| RateLimiter::fixed_window(1, Duration::from_secs(3600)).unwrap());

        let a = registry.get_or_create("tenant-a");
        let b = registry.get_or_create("tenant-b");

        assert!(a.acquire(1, None).await.is_ok());
        assert!(a.acquire(1, None).await.is_err());
        // tenant-b has its own pool, unaffected by tenant-a's exhaustion.
        assert!(b.acquire(1, None).await.is_ok());

        assert_eq!(registry.len(), 2);
        let a_again = registry.get_or_create("tenant-a");
        assert!(a_again.acquire(1, None).await.is_err()); // same instance, still exhausted
    }

    #[tokio::test]
    async fn on_rejected_runs_on_every_rejection_but_error_still_propagates() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let limiter = RateLimiter::fixed_window(1, Duration::from_secs(60))
            .unwrap()
            .on_rejected(move |retry_after| seen_cb.lock().unwrap().push(retry_after))
            .build();

        assert!(limiter.acquire(1, None).await.is_ok());
        let err = limiter.acquire(1, None).await.unwrap_err();

        assert_eq!(*seen.lock().unwrap(), vec![err]);
    }

    #[test]
    fn builder_validates_total_permits_and_period() {
        assert!(RateLimiter::fixed_window(0, Duration::from_secs(1)).is_err());
        assert!(RateLimiter::fixed_window(1, Duration::ZERO).is_err());
        assert!(RateLimiter::token_bucket(0, Duration::from_secs(1)).is_err());
        assert!(RateLimiter::sliding_window(1, Duration::from_secs(1), 0).is_err());
    }
}
