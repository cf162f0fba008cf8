//! Result-queue relay: drains worker results into the event router.
//!
//! One long-running task per API process. Every received message is deleted
//! from the queue regardless of delivery outcome: a result whose client is
//! no longer live is dropped, not retried, because a retry would only replay
//! stale data (at-most-once delivery to live consumers).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use manimatic_core::{Error, EventEnvelope, MessageQueue, QueueMessage};

use crate::router::{EventRouter, PublishOutcome};

/// Backoff after a transient receive failure.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Drains the result queue into the event router.
pub struct ResultRelay {
    queue: Arc<dyn MessageQueue>,
    router: Arc<EventRouter>,
}

impl ResultRelay {
    /// Creates a relay over the given result queue and router.
    #[must_use]
    pub fn new(queue: Arc<dyn MessageQueue>, router: Arc<EventRouter>) -> Self {
        Self { queue, router }
    }

    /// Runs the relay loop until cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("result relay shutting down");
                    return;
                }
                received = self.queue.receive() => received,
            };

            match received {
                Ok(message) => self.handle_message(message).await,
                Err(Error::NoMessages) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "failed to receive result message");
                    tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn handle_message(&self, message: QueueMessage) {
        match EventEnvelope::decode(&message.body) {
            Ok(envelope) => {
                match self.router.publish(&envelope) {
                    PublishOutcome::Delivered => {
                        tracing::debug!(
                            session_id = %envelope.session_id,
                            kind = envelope.kind(),
                            "result delivered to client stream"
                        );
                    }
                    outcome => {
                        tracing::debug!(
                            session_id = %envelope.session_id,
                            kind = envelope.kind(),
                            outcome = ?outcome,
                            "result dropped"
                        );
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to decode result message, removing it");
            }
        }

        // Delete regardless of outcome: at-most-once to live consumers.
        if let Err(err) = self.queue.delete(&message.receipt_handle).await {
            tracing::error!(error = %err, "failed to delete result message");
        }
    }
}
