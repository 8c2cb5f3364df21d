//! Event bus shared by all three engines (C8).
//!
//! Each engine owns one `EventBus<Event>`. Emission happens after the engine's lock is
//! released. Built directly on `tokio::sync::broadcast`, which already gives us the required
//! contract for free: bounded capacity, oldest-dropped semantics for a lagging subscriber
//! (it next receives `Lagged(n)` rather than blocking the sender), and no producer blocking.
//! Unsubscription is just dropping the `Receiver`; delivery in progress to that receiver is
//! abandoned, not waited on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tower_service::Service;
use tracing::trace;

/// Default channel capacity for an engine's event bus. Chosen generously relative to typical
/// per-call event volume; slow subscribers fall behind and see `Lagged`, they never stall a
/// producer.
pub const DEFAULT_CAPACITY: usize = 256;

/// Multi-producer, multi-subscriber broadcast of one engine's events.
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
    dropped: Arc<AtomicU64>,
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl<E: Clone> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone(), dropped: Arc::clone(&self.dropped) }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Subscribe to future events. Past events are never replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Number of emissions that had zero live subscribers (counted as dropped, since nothing
    /// could possibly have received them).
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Non-blocking emit. Never suspends, never panics on a full channel or no subscribers.
    pub fn emit(&self, event: E) {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("event bus emit with no live subscribers");
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pluggable telemetry sink, modeled as a `tower::Service` so sinks compose with ordinary
/// tower middleware (retries, rate limiting, batching) the same way a request-handling
/// service would.
pub trait TelemetrySink<E>: Service<E, Response = ()> + Clone + Send + 'static {}

impl<E, S> TelemetrySink<E> for S where S: Service<E, Response = ()> + Clone + Send + 'static {}

/// Send `event` to `sink`, swallowing any error. Telemetry must never fail the call it is
/// reporting on.
pub async fn emit_best_effort<E, S>(mut sink: S, event: E)
where
    S: TelemetrySink<E>,
    S::Future: Send,
{
    use futures::future::poll_fn;
    use std::task::Poll;

    let ready = poll_fn(|cx| match sink.poll_ready(cx) {
        Poll::Ready(r) => Poll::Ready(r),
        Poll::Pending => Poll::Pending,
    })
    .await;
    if ready.is_err() {
        return;
    }
    let _ = sink.call(event).await;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl<E> Service<E> for NullSink {
    type Response = ();
    type Error = std::convert::Infallible;
    type Future = std::future::Ready<Result<(), Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: E) -> Self::Future {
        std::future::ready(Ok(()))
    }
}

/// Logs every event via `tracing::info!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl<E: fmt::Display> Service<E> for LogSink {
    type Response = ();
    type Error = std::convert::Infallible;
    type Future = std::future::Ready<Result<(), Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: E) -> Self::Future {
        tracing::info!(%event, "resilience event");
        std::future::ready(Ok(()))
    }
}

/// Accumulates events in memory, bounded, oldest-dropped. Mostly useful for tests.
#[derive(Debug, Clone)]
pub struct MemorySink<E> {
    events: Arc<std::sync::Mutex<std::collections::VecDeque<E>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl<E> MemorySink<E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Arc::new(std::sync::Mutex::new(std::collections::VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<E>
    where
        E: Clone,
    {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect()
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl<E: Send + 'static> Service<E> for MemorySink<E> {
    type Response = ();
    type Error = std::convert::Infallible;
    type Future = std::future::Ready<Result<(), Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: E) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        std::future::ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample(u32);

    #[tokio::test]
    async fn subscribers_receive_emitted_events_in_order() {
        let bus: EventBus<Sample> = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Sample(1));
        bus.emit(Sample(2));
        assert_eq!(rx.recv().await.unwrap(), Sample(1));
        assert_eq!(rx.recv().await.unwrap(), Sample(2));
    }

    #[test]
    fn emit_with_no_subscribers_counts_as_dropped_not_panicking() {
        let bus: EventBus<Sample> = EventBus::new();
        bus.emit(Sample(1));
        assert_eq!(bus.dropped_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus: EventBus<Sample> = EventBus::new();
        {
            let _rx = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn null_sink_discards_everything() {
        emit_best_effort(NullSink, Sample(1)).await;
    }

    #[tokio::test]
    async fn memory_sink_records_and_evicts_oldest() {
        let sink = MemorySink::new(2);
        emit_best_effort(sink.clone(), Sample(1)).await;
        emit_best_effort(sink.clone(), Sample(2)).await;
        emit_best_effort(sink.clone(), Sample(3)).await;
        assert_eq!(sink.events(), vec![Sample(2), Sample(3)]);
        assert_eq!(sink.evicted_count(), 1);
    }
}
