//! # manimatic-api
//!
//! API tier for the Manimatic animation pipeline.
//!
//! This crate composes the HTTP surface over the shared contracts in
//! `manimatic-core`:
//!
//! - **Generation**: `POST /generate` asks a language-model provider for an
//!   animation script and forwards it to the task queue
//! - **Delivery**: a single relay task drains the result queue into the
//!   session-scoped event router, which fans out to `GET /events` SSE
//!   streams
//! - **Sessions**: an encrypted cookie ties a browser to its stream and any
//!   queued results addressed to it
//!
//! ## Endpoints
//!
//! ```text
//! POST /generate   - body {prompt, model?}; 204 on accepted
//! POST /compile    - body {script}; 204 on accepted (feature user-compile)
//! GET  /events     - SSE stream, one data: frame per event
//! GET  /healthz    - liveness check
//! GET  /features   - current feature flags
//! GET  /models     - available provider model ids and default
//! ```
//!
//! ## Design principles
//!
//! The event router is a leaf within this process: the relay depends on the
//! router, never the reverse. Publishing is non-blocking with a bounded
//! buffer per subscriber, so a slow client can only lose its own events.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod features;
pub mod llm;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;
