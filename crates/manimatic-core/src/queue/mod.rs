//! Message queue abstraction for the compile pipeline.
//!
//! This module provides:
//!
//! - [`MessageQueue`]: capability trait for receiving, acknowledging, and
//!   publishing envelope bodies
//! - [`QueueMessage`]: one received message with its receipt handle
//! - [`MemoryQueue`]: in-memory implementation for testing
//! - [`SqsQueue`]: SQS-backed implementation for deployment
//!
//! ## Directionality
//!
//! A queue handle is bound to an inbox/outbox pair. `receive` and `delete`
//! operate on the inbox; `send` publishes to the outbox. The worker binds
//! (task queue, result queue) and the API process binds the inverse, so both
//! sides share one contract.
//!
//! ## Delivery semantics
//!
//! The transport provides at-least-once delivery with a visibility timeout.
//! `delete` is the acknowledgement boundary: a crashed consumer has its
//! in-flight message redelivered after visibility expiry.

pub mod memory;
pub mod sqs;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryQueue;
pub use sqs::SqsQueue;

/// One message received from a queue.
///
/// The receipt handle stays valid until the message is deleted or its
/// visibility timeout expires and it redelivers.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Transport-assigned message identifier (for logging).
    pub message_id: String,
    /// The message body: an encoded event envelope.
    pub body: String,
    /// Handle used to delete (acknowledge) this delivery.
    pub receipt_handle: String,
}

/// Capability trait for queue transports.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receives a single message from the inbox with a bounded long poll.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMessages`](crate::Error::NoMessages) when the poll
    /// completes empty, [`Error::QueueNotExist`](crate::Error::QueueNotExist)
    /// when the inbox is misconfigured, and
    /// [`Error::Queue`](crate::Error::Queue) for transport failures.
    async fn receive(&self) -> Result<QueueMessage>;

    /// Deletes (acknowledges) a previously received message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Queue`](crate::Error::Queue) if the transport rejects
    /// the receipt handle.
    async fn delete(&self, receipt_handle: &str) -> Result<()>;

    /// Publishes a message body to the outbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Queue`](crate::Error::Queue) on transport failures.
    async fn send(&self, body: String) -> Result<()>;
}
