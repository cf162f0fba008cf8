//! # manimatic-worker
//!
//! Worker tier for the Manimatic animation pipeline.
//!
//! The worker long-polls the task queue for `compile_requested` events,
//! renders each script through the external renderer under sandbox rules,
//! uploads the artifact to the video bucket, and publishes a
//! `compile_succeeded` or `compile_failed` result for the API tier to relay.
//!
//! ## Usage
//!
//! ```bash
//! manimatic-worker \
//!     --task-queue-url https://sqs.eu-central-1.amazonaws.com/…/manim-task-queue \
//!     --result-queue-url https://sqs.eu-central-1.amazonaws.com/…/manim-result-queue \
//!     --video-bucket-name manim-worker-bucket
//! ```
//!
//! Every flag is also reachable as an environment variable
//! (`TASK_QUEUE_URL`, `RESULT_QUEUE_URL`, `VIDEO_BUCKET_NAME`, …).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod executor;
pub mod pool;
pub mod service;
pub mod validator;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use manimatic_core::{BlobStore, LogFormat, MessageQueue, S3BlobStore, SqsQueue, init_logging};

use crate::executor::{Quality, ScriptExecutor};
use crate::service::WorkerService;

/// Worker pool size bounds; values outside are clamped.
const MIN_CONCURRENCY: usize = 1;
const MAX_CONCURRENCY: usize = 20;

/// Floor for the presign TTL: the URL must outlive queue-to-client delivery.
const MIN_PRESIGN_TTL_SECS: u64 = 60;

/// Manimatic render worker.
#[derive(Debug, Parser)]
#[command(name = "manimatic-worker")]
#[command(about = "Renders queued animation scripts and publishes results")]
#[command(version)]
struct Args {
    /// Task queue URL to consume compile requests from.
    #[arg(long, env = "TASK_QUEUE_URL")]
    task_queue_url: String,

    /// Result queue URL to publish compile outcomes to.
    #[arg(long, env = "RESULT_QUEUE_URL")]
    result_queue_url: String,

    /// Object-store bucket for rendered artifacts.
    #[arg(long, env = "VIDEO_BUCKET_NAME")]
    video_bucket_name: String,

    /// Custom AWS endpoint URL (for local stacks).
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    aws_endpoint_url: Option<String>,

    /// Log level (debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (text or json).
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Worker pool size; defaults to the logical CPU count, clamped to [1, 20].
    #[arg(long, env = "MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// Base directory for per-task working directories.
    #[arg(long, env = "WORKER_DIR")]
    worker_dir: Option<PathBuf>,

    /// Comma-separated feature flags (high-quality enables 4K rendering).
    #[arg(long, env = "FEATURES", default_value = "")]
    features: String,

    /// Validity window of presigned artifact URLs, in seconds.
    #[arg(long, env = "PRESIGN_TTL_SECS", default_value = "180")]
    presign_ttl_secs: u64,
}

impl Args {
    fn concurrency(&self) -> usize {
        let default = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        self.max_concurrency
            .unwrap_or(default)
            .clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }

    fn quality(&self) -> Quality {
        let high_quality = self
            .features
            .split(',')
            .any(|feature| feature.trim() == "high-quality");
        if high_quality { Quality::High } else { Quality::Low }
    }

    fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs.max(MIN_PRESIGN_TTL_SECS))
    }

    fn worker_dir(&self) -> PathBuf {
        self.worker_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format, &args.log_level);

    let queue = SqsQueue::connect(
        args.aws_endpoint_url.as_deref(),
        &args.task_queue_url,
        &args.result_queue_url,
    )
    .await;
    let queue: Arc<dyn MessageQueue> = Arc::new(queue);

    let blob_store = S3BlobStore::from_bucket(
        &args.video_bucket_name,
        args.aws_endpoint_url.as_deref(),
    )
    .context("failed to configure video bucket")?;
    let blob_store: Arc<dyn BlobStore> = Arc::new(blob_store);

    let executor = ScriptExecutor::new(args.worker_dir())
        .context("failed to initialize tasks directory")?
        .with_quality(args.quality());

    let service = Arc::new(WorkerService::new(
        queue,
        blob_store,
        executor,
        args.presign_ttl(),
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        });
    }

    tracing::info!(
        task_queue = %args.task_queue_url,
        result_queue = %args.result_queue_url,
        bucket = %args.video_bucket_name,
        workers = args.concurrency(),
        "starting worker service"
    );

    service.run(args.concurrency(), cancel).await?;
    tracing::info!("worker shut down cleanly");
    Ok(())
}
