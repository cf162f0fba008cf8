//! Session-scoped event routing to live client streams.
//!
//! The router is the single serialization point between asynchronous queue
//! consumption and client fan-out: a map from session id to a bounded
//! delivery channel, guarded by a reader-writer lock. Publishing takes a
//! shared lease and performs a non-blocking send, so one slow SSE consumer
//! can never back-pressure the result relay; a saturated channel drops the
//! event instead.
//!
//! At most one subscription exists per session. A second subscribe replaces
//! the first: the prior channel closes and its in-flight items are dropped.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use manimatic_core::EventEnvelope;

/// Delivery channel capacity per subscriber.
const SUBSCRIBER_BUFFER: usize = 10;

/// Outcome of a non-blocking publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The event was enqueued to the session's channel.
    Delivered,
    /// No live subscriber for that session; the event was dropped.
    NoSubscriber,
    /// The channel is at capacity; the event was dropped. Callers must not
    /// retry synchronously.
    Saturated,
    /// The router has been shut down.
    Shutdown,
}

#[derive(Debug)]
struct SubscriberSlot {
    /// Generation tag; an unsubscribe only removes its own generation, so a
    /// replacement subscription is never torn down by the old guard.
    id: u64,
    tx: mpsc::Sender<EventEnvelope>,
}

#[derive(Debug, Default)]
struct RouterState {
    subscribers: HashMap<String, SubscriberSlot>,
    next_id: u64,
    shutdown: bool,
}

/// The session → stream registry for the API process.
#[derive(Debug, Default)]
pub struct EventRouter {
    state: RwLock<RouterState>,
}

impl EventRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to events for `session_id`.
    ///
    /// Replaces any prior subscription for the session, closing its stream.
    /// After [`shutdown`](Self::shutdown) the returned stream is already
    /// closed.
    pub fn subscribe(self: &Arc<Self>, session_id: impl Into<String>) -> Subscription {
        let session_id = session_id.into();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.shutdown {
            drop(tx);
            return Subscription { rx, guard: None };
        }

        let id = state.next_id;
        state.next_id += 1;
        // Dropping a previous slot's sender closes the old stream.
        state.subscribers.insert(
            session_id.clone(),
            SubscriberSlot { id, tx },
        );
        drop(state);
        tracing::debug!(session_id = %session_id, "client subscribed");

        Subscription {
            rx,
            guard: Some(SubscriptionGuard {
                router: Arc::clone(self),
                session_id,
                id,
            }),
        }
    }

    /// Attempts a non-blocking delivery of `envelope` to its session.
    pub fn publish(&self, envelope: &EventEnvelope) -> PublishOutcome {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.shutdown {
            return PublishOutcome::Shutdown;
        }

        let Some(slot) = state.subscribers.get(&envelope.session_id) else {
            return PublishOutcome::NoSubscriber;
        };

        match slot.tx.try_send(envelope.clone()) {
            Ok(()) => PublishOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => PublishOutcome::Saturated,
            Err(mpsc::error::TrySendError::Closed(_)) => PublishOutcome::NoSubscriber,
        }
    }

    /// Closes every subscriber stream and rejects further publishes.
    pub fn shutdown(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.shutdown = true;
        state.subscribers.clear();
        tracing::debug!("event router shut down");
    }

    fn unsubscribe(&self, session_id: &str, id: u64) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state
            .subscribers
            .get(session_id)
            .is_some_and(|slot| slot.id == id)
        {
            state.subscribers.remove(session_id);
            tracing::debug!(session_id = %session_id, "client unsubscribed");
        }
    }
}

/// A live event stream for one session.
///
/// Unsubscribes on drop. The stream ends when the router shuts down or the
/// subscription is replaced.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<EventEnvelope>,
    guard: Option<SubscriptionGuard>,
}

impl Stream for Subscription {
    type Item = EventEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug)]
struct SubscriptionGuard {
    router: Arc<EventRouter>,
    session_id: String,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.router.unsubscribe(&self.session_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn event(session: &str, url: &str) -> EventEnvelope {
        EventEnvelope::compile_succeeded(session, url)
    }

    #[tokio::test]
    async fn publish_delivers_to_matching_subscriber() {
        let router = Arc::new(EventRouter::new());
        let mut subscription = router.subscribe("s1");

        let envelope = event("s1", "https://example.com/a.mp4");
        assert_eq!(router.publish(&envelope), PublishOutcome::Delivered);
        assert_eq!(subscription.next().await, Some(envelope));
    }

    #[tokio::test]
    async fn publish_without_subscriber_drops() {
        let router = Arc::new(EventRouter::new());
        assert_eq!(
            router.publish(&event("nobody", "u")),
            PublishOutcome::NoSubscriber
        );
    }

    #[tokio::test]
    async fn publish_saturates_at_channel_capacity() {
        let router = Arc::new(EventRouter::new());
        let _subscription = router.subscribe("s1");

        for _ in 0..SUBSCRIBER_BUFFER {
            assert_eq!(router.publish(&event("s1", "u")), PublishOutcome::Delivered);
        }
        assert_eq!(router.publish(&event("s1", "u")), PublishOutcome::Saturated);
    }

    #[tokio::test]
    async fn per_session_delivery_preserves_publish_order() {
        let router = Arc::new(EventRouter::new());
        let mut subscription = router.subscribe("s1");

        for n in 0..5 {
            router.publish(&event("s1", &format!("url-{n}")));
        }
        for n in 0..5 {
            let received = subscription.next().await.expect("event available");
            let manimatic_core::EventPayload::CompileSucceeded(success) = received.payload else {
                panic!("unexpected payload");
            };
            assert_eq!(success.video_url, format!("url-{n}"));
        }
    }

    #[tokio::test]
    async fn second_subscribe_replaces_and_closes_the_first() {
        let router = Arc::new(EventRouter::new());
        let mut first = router.subscribe("s1");
        let mut second = router.subscribe("s1");

        // The replaced stream is closed.
        assert_eq!(first.next().await, None);

        // Subsequent envelopes reach only the replacement.
        let envelope = event("s1", "u");
        assert_eq!(router.publish(&envelope), PublishOutcome::Delivered);
        assert_eq!(second.next().await, Some(envelope));
    }

    #[tokio::test]
    async fn dropping_replaced_subscription_leaves_replacement_installed() {
        let router = Arc::new(EventRouter::new());
        let first = router.subscribe("s1");
        let mut second = router.subscribe("s1");

        // The old guard must not tear down the new subscription.
        drop(first);

        let envelope = event("s1", "u");
        assert_eq!(router.publish(&envelope), PublishOutcome::Delivered);
        assert_eq!(second.next().await, Some(envelope));
    }

    #[tokio::test]
    async fn unsubscribe_on_drop_removes_the_channel() {
        let router = Arc::new(EventRouter::new());
        let subscription = router.subscribe("s1");
        drop(subscription);

        assert_eq!(router.publish(&event("s1", "u")), PublishOutcome::NoSubscriber);
    }

    #[tokio::test]
    async fn shutdown_closes_streams_and_rejects_publishes() {
        let router = Arc::new(EventRouter::new());
        let mut subscription = router.subscribe("s1");

        router.shutdown();
        assert_eq!(subscription.next().await, None);
        assert_eq!(router.publish(&event("s1", "u")), PublishOutcome::Shutdown);

        // Subscribing after shutdown yields an already-closed stream.
        let mut late = router.subscribe("s2");
        assert_eq!(late.next().await, None);
    }
}
