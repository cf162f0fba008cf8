//! Worker orchestration: fetch loop, task lifecycle, result publishing.
//!
//! A single fetch loop long-polls the task queue and feeds the bounded
//! worker pool; `submit` blocking at capacity is the backpressure that slows
//! message draining without dropping anything. Workers run the full task
//! lifecycle: decode, execute, upload, presign, publish, acknowledge.
//!
//! ## Acknowledgement ordering
//!
//! The task message is deleted once per outcome, on the resolution path,
//! just before the result publication completes the task. A failed result
//! publish therefore loses the result rather than replaying the render: the
//! client sees nothing for that request and may retry, which is cheaper than
//! a duplicate render.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use manimatic_core::events::EventPayload;
use manimatic_core::{BlobStore, Error, EventEnvelope, MessageQueue, QueueMessage};

use crate::executor::{ExecutionOutput, ScriptExecutor};
use crate::pool::WorkerPool;

/// Backoff after a transient receive failure.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One compile request flowing through the worker tier.
///
/// Lives from queue receive until its receipt is deleted (or visibility
/// expires and the message redelivers).
#[derive(Debug)]
pub struct Task {
    /// The received queue message carrying an encoded envelope.
    pub message: QueueMessage,
}

/// The worker-tier service: consumes compile requests, publishes results.
pub struct WorkerService {
    queue: Arc<dyn MessageQueue>,
    blob_store: Arc<dyn BlobStore>,
    executor: ScriptExecutor,
    presign_ttl: Duration,
}

impl WorkerService {
    /// Creates a worker service over the given capabilities.
    #[must_use]
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        blob_store: Arc<dyn BlobStore>,
        executor: ScriptExecutor,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            queue,
            blob_store,
            executor,
            presign_ttl,
        }
    }

    /// Runs the fetch loop with a pool of `worker_count` workers until
    /// cancellation, then drains in-flight tasks.
    ///
    /// # Errors
    ///
    /// Returns an error only for fatal conditions (the task queue does not
    /// exist, or the pool stopped unexpectedly); transient receive failures
    /// are retried with backoff.
    pub async fn run(self: Arc<Self>, worker_count: usize, cancel: CancellationToken) -> Result<()> {
        let pool = {
            let service = Arc::clone(&self);
            WorkerPool::start(worker_count, move |task| {
                let service = Arc::clone(&service);
                async move { service.process_task(task).await }
            })
        };
        tracing::info!(workers = worker_count, "worker pool started");

        let result = self.fetch_loop(&pool, &cancel).await;

        tracing::info!("draining worker pool");
        pool.stop().await;
        result
    }

    async fn fetch_loop(&self, pool: &WorkerPool<Task>, cancel: &CancellationToken) -> Result<()> {
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("fetch loop shutting down");
                    return Ok(());
                }
                received = self.queue.receive() => received,
            };

            match received {
                Ok(message) => {
                    tracing::debug!(message_id = %message.message_id, "task message received");
                    pool.submit(Task { message })
                        .await
                        .context("worker pool rejected task")?;
                }
                Err(Error::NoMessages) => {}
                Err(err @ Error::QueueNotExist { .. }) => {
                    // Misconfiguration, not a transient fault.
                    return Err(err).context("task queue unavailable");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to receive task message");
                    tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Processes one task through its full lifecycle.
    ///
    /// # Errors
    ///
    /// Returns an error for infrastructure failures (queue delete, upload);
    /// script-level failures resolve the task successfully by publishing a
    /// `compile_failed` result.
    pub async fn process_task(&self, task: Task) -> Result<()> {
        let receipt = &task.message.receipt_handle;

        let envelope = match EventEnvelope::decode(&task.message.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(error = %err, "failed to decode task message, removing it");
                return self.delete_task(receipt).await;
            }
        };

        let EventPayload::CompileRequested(request) = &envelope.payload else {
            // Anything else on the task queue is a protocol violation and
            // would poison the queue if left to redeliver.
            tracing::error!(kind = envelope.kind(), "unexpected event kind on task queue, removing it");
            return self.delete_task(receipt).await;
        };

        match self.executor.execute(&request.script, &envelope.session_id).await {
            Err(exec_err) => {
                tracing::error!(
                    session_id = %envelope.session_id,
                    error = %exec_err,
                    "script execution failed"
                );
                self.publish(&exec_err.to_event(&envelope.session_id)).await;
                self.delete_task(receipt).await
            }
            Ok(output) => {
                self.delete_task(receipt).await?;
                let result = self.finish_success(&envelope.session_id, &output).await;
                let _ = tokio::fs::remove_dir_all(&output.working_dir).await;
                result
            }
        }
    }

    async fn finish_success(&self, session_id: &str, output: &ExecutionOutput) -> Result<()> {
        let url = self.upload_and_presign(session_id, output).await?;
        self.publish(&EventEnvelope::compile_succeeded(session_id, url)).await;
        Ok(())
    }

    async fn upload_and_presign(
        &self,
        session_id: &str,
        output: &ExecutionOutput,
    ) -> Result<String> {
        let extension = output
            .output_path
            .extension()
            .and_then(|e| e.to_str())
            .context("artifact file has no extension")?;

        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let key = format!("manim_outputs/{session_id}/{timestamp}.{extension}");

        let data = tokio::fs::read(&output.output_path)
            .await
            .context("failed to read rendered artifact")?;
        self.blob_store
            .upload(&key, Bytes::from(data))
            .await
            .context("artifact upload failed")?;

        self.blob_store
            .presign_get(&key, self.presign_ttl)
            .await
            .context("artifact presign failed")
    }

    /// Publishes a result envelope; failures are logged, never retried.
    async fn publish(&self, envelope: &EventEnvelope) {
        let body = match envelope.encode() {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode result envelope");
                return;
            }
        };
        if let Err(err) = self.queue.send(body).await {
            tracing::error!(
                kind = envelope.kind(),
                session_id = %envelope.session_id,
                error = %err,
                "failed to publish result"
            );
        }
    }

    async fn delete_task(&self, receipt_handle: &str) -> Result<()> {
        self.queue
            .delete(receipt_handle)
            .await
            .context("task message deletion failed")
    }
}
