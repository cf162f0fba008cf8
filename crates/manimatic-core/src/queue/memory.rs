//! In-memory queue implementation for testing.
//!
//! Provides [`MemoryQueue`], a thread-safe implementation of the
//! [`MessageQueue`] trait backed by `VecDeque`s.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no persistence, no distribution
//! - **No visibility timeout**: a received message stays in flight until
//!   deleted; redelivery is not simulated

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{MessageQueue, QueueMessage};
use crate::error::{Error, Result};

type SharedDeque = Arc<Mutex<VecDeque<String>>>;

/// Bounded wait applied when the inbox is empty, standing in for the
/// transport's long poll so receive loops do not spin.
const EMPTY_POLL_DELAY: Duration = Duration::from_millis(10);

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "memory queue lock poisoned".to_string(),
    }
}

/// In-memory queue for testing.
///
/// ## Example
///
/// ```rust
/// use manimatic_core::queue::MemoryQueue;
///
/// let queue = MemoryQueue::new();
/// queue.push_inbox("{\"kind\":\"...\"}");
/// ```
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inbox: SharedDeque,
    outbox: SharedDeque,
    in_flight: Mutex<HashMap<String, String>>,
}

impl MemoryQueue {
    /// Creates a new empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates two handles wired inbox-to-outbox.
    ///
    /// Messages sent on the first handle become receivable on the second and
    /// vice versa, mirroring the worker/API queue pairing in tests.
    #[must_use]
    pub fn linked_pair() -> (Self, Self) {
        let forward: SharedDeque = Arc::default();
        let backward: SharedDeque = Arc::default();

        let a = Self {
            inbox: Arc::clone(&backward),
            outbox: Arc::clone(&forward),
            in_flight: Mutex::new(HashMap::new()),
        };
        let b = Self {
            inbox: forward,
            outbox: backward,
            in_flight: Mutex::new(HashMap::new()),
        };
        (a, b)
    }

    /// Pushes a message body directly onto the inbox.
    ///
    /// # Panics
    ///
    /// Panics if the inbox lock is poisoned (test-only helper).
    pub fn push_inbox(&self, body: impl Into<String>) {
        self.inbox
            .lock()
            .expect("inbox lock poisoned")
            .push_back(body.into());
    }

    /// Returns the number of messages waiting in the inbox.
    ///
    /// # Panics
    ///
    /// Panics if the inbox lock is poisoned (test-only helper).
    #[must_use]
    pub fn inbox_len(&self) -> usize {
        self.inbox.lock().expect("inbox lock poisoned").len()
    }

    /// Returns the number of received-but-undeleted messages.
    ///
    /// # Panics
    ///
    /// Panics if the in-flight lock is poisoned (test-only helper).
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().expect("in-flight lock poisoned").len()
    }

    /// Drains and returns every message sent to the outbox so far.
    ///
    /// # Panics
    ///
    /// Panics if the outbox lock is poisoned (test-only helper).
    #[must_use]
    pub fn drain_outbox(&self) -> Vec<String> {
        self.outbox
            .lock()
            .expect("outbox lock poisoned")
            .drain(..)
            .collect()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn receive(&self) -> Result<QueueMessage> {
        let mut popped = self.inbox.lock().map_err(poison_err)?.pop_front();
        if popped.is_none() {
            tokio::time::sleep(EMPTY_POLL_DELAY).await;
            popped = self.inbox.lock().map_err(poison_err)?.pop_front();
        }
        let body = popped.ok_or(Error::NoMessages)?;

        let receipt_handle = Uuid::new_v4().to_string();
        self.in_flight
            .lock()
            .map_err(poison_err)?
            .insert(receipt_handle.clone(), body.clone());

        Ok(QueueMessage {
            message_id: Uuid::new_v4().to_string(),
            body,
            receipt_handle,
        })
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        let removed = self
            .in_flight
            .lock()
            .map_err(poison_err)?
            .remove(receipt_handle);

        if removed.is_none() {
            return Err(Error::queue(format!(
                "unknown receipt handle: {receipt_handle}"
            )));
        }
        Ok(())
    }

    async fn send(&self, body: String) -> Result<()> {
        self.outbox.lock().map_err(poison_err)?.push_back(body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_empty_inbox_yields_no_messages() {
        let queue = MemoryQueue::new();
        let err = queue.receive().await.expect_err("inbox is empty");
        assert!(err.is_no_messages());
    }

    #[tokio::test]
    async fn receive_then_delete_acknowledges() {
        let queue = MemoryQueue::new();
        queue.push_inbox("body-1");

        let message = queue.receive().await.expect("message available");
        assert_eq!(message.body, "body-1");
        assert_eq!(queue.in_flight_len(), 1);

        queue
            .delete(&message.receipt_handle)
            .await
            .expect("delete should succeed");
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn delete_rejects_unknown_receipt() {
        let queue = MemoryQueue::new();
        let err = queue.delete("bogus").await.expect_err("unknown receipt");
        assert!(matches!(err, Error::Queue { .. }));
    }

    #[tokio::test]
    async fn receive_preserves_fifo_order() {
        let queue = MemoryQueue::new();
        queue.push_inbox("first");
        queue.push_inbox("second");

        let first = queue.receive().await.expect("first message");
        let second = queue.receive().await.expect("second message");
        assert_eq!(first.body, "first");
        assert_eq!(second.body, "second");
    }

    #[tokio::test]
    async fn linked_pair_routes_sends_to_peer_inbox() {
        let (worker_side, api_side) = MemoryQueue::linked_pair();

        worker_side
            .send("result".to_string())
            .await
            .expect("send should succeed");
        let received = api_side.receive().await.expect("peer should receive");
        assert_eq!(received.body, "result");

        api_side
            .send("task".to_string())
            .await
            .expect("send should succeed");
        let received = worker_side.receive().await.expect("peer should receive");
        assert_eq!(received.body, "task");
    }
}
