//! # manimatic-core
//!
//! Shared contracts for the Manimatic animation pipeline.
//!
//! Manimatic turns a natural-language prompt into a rendered mathematical
//! animation through a two-tier, queue-mediated pipeline: an API process
//! generates an animation script and enqueues a compile request; a worker
//! process renders the script in a sandbox, uploads the artifact, and
//! publishes the result back for delivery over the client's event stream.
//!
//! This crate holds everything both tiers agree on:
//!
//! - [`events`]: the [`EventEnvelope`] wire format for queue messages and
//!   SSE frames
//! - [`queue`]: the [`MessageQueue`] capability with in-memory and SQS
//!   implementations
//! - [`storage`]: the [`BlobStore`] capability with in-memory and S3
//!   implementations
//! - [`observability`]: logging initialization
//! - [`error`]: the shared [`Error`] type
//!
//! ## Design principles
//!
//! This crate is a leaf: it depends on no other Manimatic crate and carries
//! no process-specific policy. The API and worker crates compose these
//! contracts into their respective loops.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod events;
pub mod observability;
pub mod queue;
pub mod storage;

pub use error::{Error, Result};
pub use events::{EventEnvelope, EventPayload};
pub use observability::{LogFormat, init_logging};
pub use queue::{MemoryQueue, MessageQueue, QueueMessage, SqsQueue};
pub use storage::{BlobStore, MemoryBlobStore, S3BlobStore};
