//! Lifecycle event envelopes exchanged between the API tier, the worker
//! tier, and live clients.
//!
//! An envelope is a tagged record: a `kind` discriminator, the `session_id`
//! routing key, and a kind-specific payload nested under `data`. The wire
//! form is shared by queue message bodies and SSE frames:
//!
//! ```json
//! {"kind": "compile_succeeded", "session_id": "…", "data": {"video_url": "…"}}
//! ```
//!
//! Decoding dispatches on `kind` before payload parsing so an unrecognized
//! kind surfaces as [`Error::UnknownEventKind`] rather than a generic parse
//! failure. Round-trip identity holds for every supported kind:
//! `decode(encode(e)) == e`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind discriminator for a compile request (API → worker).
pub const KIND_COMPILE_REQUESTED: &str = "compile_requested";
/// Kind discriminator for a successful compilation (worker → API).
pub const KIND_COMPILE_SUCCEEDED: &str = "compile_succeeded";
/// Kind discriminator for a failed compilation (worker → API).
pub const KIND_COMPILE_FAILED: &str = "compile_failed";
/// Kind discriminator for a successful script generation (API → client).
pub const KIND_GENERATE_SUCCEEDED: &str = "generate_succeeded";
/// Kind discriminator for a failed script generation (API → client).
pub const KIND_GENERATE_FAILED: &str = "generate_failed";

/// Payload of a `compile_requested` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    /// The generated animation script to compile.
    pub script: String,
}

/// Payload of a `compile_succeeded` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileSuccess {
    /// Time-limited download URL for the rendered artifact.
    pub video_url: String,
}

/// Payload of a `compile_failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileFailure {
    /// User-readable error message.
    pub message: String,
    /// Captured renderer standard output.
    pub stdout: String,
    /// Captured renderer standard error.
    pub stderr: String,
    /// Line number where the error occurred, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// Payload of a `generate_succeeded` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateSuccess {
    /// The generated animation script.
    pub script: String,
}

/// Payload of a `generate_failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateFailure {
    /// User-readable error message.
    pub message: String,
    /// Additional context about the failure.
    pub details: String,
    /// The model that produced the failure.
    pub model: String,
}

/// Kind-specific payload of an [`EventEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// A request to compile a script (API → worker).
    CompileRequested(CompileRequest),
    /// Compilation succeeded (worker → API).
    CompileSucceeded(CompileSuccess),
    /// Compilation failed (worker → API).
    CompileFailed(CompileFailure),
    /// Script generation succeeded (API → client).
    GenerateSucceeded(GenerateSuccess),
    /// Script generation failed (API → client).
    GenerateFailed(GenerateFailure),
}

/// A lifecycle event and its routing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventEnvelope {
    /// Session the event belongs to. Never empty on a queue.
    pub session_id: String,
    /// The kind discriminator and payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Raw wire form used to dispatch on `kind` before payload parsing.
#[derive(Deserialize)]
struct RawEnvelope {
    kind: String,
    session_id: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl EventEnvelope {
    /// Creates a `compile_requested` envelope.
    #[must_use]
    pub fn compile_requested(session_id: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            payload: EventPayload::CompileRequested(CompileRequest {
                script: script.into(),
            }),
        }
    }

    /// Creates a `compile_succeeded` envelope.
    #[must_use]
    pub fn compile_succeeded(session_id: impl Into<String>, video_url: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            payload: EventPayload::CompileSucceeded(CompileSuccess {
                video_url: video_url.into(),
            }),
        }
    }

    /// Creates a `compile_failed` envelope.
    #[must_use]
    pub fn compile_failed(
        session_id: impl Into<String>,
        message: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        line: Option<u32>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            payload: EventPayload::CompileFailed(CompileFailure {
                message: message.into(),
                stdout: stdout.into(),
                stderr: stderr.into(),
                line,
            }),
        }
    }

    /// Creates a `generate_succeeded` envelope.
    #[must_use]
    pub fn generate_succeeded(session_id: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            payload: EventPayload::GenerateSucceeded(GenerateSuccess {
                script: script.into(),
            }),
        }
    }

    /// Creates a `generate_failed` envelope.
    #[must_use]
    pub fn generate_failed(
        session_id: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            payload: EventPayload::GenerateFailed(GenerateFailure {
                message: message.into(),
                details: details.into(),
                model: model.into(),
            }),
        }
    }

    /// Returns the kind discriminator for this envelope.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::CompileRequested(_) => KIND_COMPILE_REQUESTED,
            EventPayload::CompileSucceeded(_) => KIND_COMPILE_SUCCEEDED,
            EventPayload::CompileFailed(_) => KIND_COMPILE_FAILED,
            EventPayload::GenerateSucceeded(_) => KIND_GENERATE_SUCCEEDED,
            EventPayload::GenerateFailed(_) => KIND_GENERATE_FAILED,
        }
    }

    /// Encodes the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if JSON encoding fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::serialization(format!("failed to encode envelope: {e}")))
    }

    /// Decodes an envelope from its JSON wire form.
    ///
    /// Dispatches on `kind` before parsing the payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for malformed JSON or a payload that
    /// does not match the kind, and [`Error::UnknownEventKind`] when the kind
    /// discriminator is outside the supported set.
    pub fn decode(body: &str) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_str(body)
            .map_err(|e| Error::serialization(format!("failed to decode envelope: {e}")))?;

        let payload = match raw.kind.as_str() {
            KIND_COMPILE_REQUESTED => EventPayload::CompileRequested(decode_data(&raw)?),
            KIND_COMPILE_SUCCEEDED => EventPayload::CompileSucceeded(decode_data(&raw)?),
            KIND_COMPILE_FAILED => EventPayload::CompileFailed(decode_data(&raw)?),
            KIND_GENERATE_SUCCEEDED => EventPayload::GenerateSucceeded(decode_data(&raw)?),
            KIND_GENERATE_FAILED => EventPayload::GenerateFailed(decode_data(&raw)?),
            _ => {
                return Err(Error::UnknownEventKind { kind: raw.kind });
            }
        };

        Ok(Self {
            session_id: raw.session_id,
            payload,
        })
    }
}

fn decode_data<T: serde::de::DeserializeOwned>(raw: &RawEnvelope) -> Result<T> {
    serde_json::from_value(raw.data.clone()).map_err(|e| {
        Error::serialization(format!("failed to decode payload for kind {}: {e}", raw.kind))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_kinds() -> Vec<EventEnvelope> {
        vec![
            EventEnvelope::compile_requested("s1", "from manim import *"),
            EventEnvelope::compile_succeeded("s2", "https://example.com/out.mp4?sig=abc"),
            EventEnvelope::compile_failed("s3", "Compilation Error: boom", "out", "err", Some(7)),
            EventEnvelope::compile_failed("s3", "Timeout Error: slow", "", "", None),
            EventEnvelope::generate_succeeded("s4", "class Scene: ..."),
            EventEnvelope::generate_failed("s5", "failed to generate script", "rate limited", "gpt-4o"),
        ]
    }

    #[test]
    fn round_trip_identity_for_all_kinds() {
        for envelope in all_kinds() {
            let encoded = envelope.encode().expect("encode should succeed");
            let decoded = EventEnvelope::decode(&encoded).expect("decode should succeed");
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn wire_form_nests_payload_under_data() {
        let envelope = EventEnvelope::compile_succeeded("abc", "https://example.com/v.mp4");
        let value: serde_json::Value =
            serde_json::from_str(&envelope.encode().expect("encode should succeed"))
                .expect("valid json");

        assert_eq!(value["kind"], "compile_succeeded");
        assert_eq!(value["session_id"], "abc");
        assert_eq!(value["data"]["video_url"], "https://example.com/v.mp4");
    }

    #[test]
    fn compile_failed_omits_absent_line() {
        let envelope = EventEnvelope::compile_failed("s", "msg", "", "", None);
        let value: serde_json::Value =
            serde_json::from_str(&envelope.encode().expect("encode should succeed"))
                .expect("valid json");
        assert!(value["data"].get("line").is_none());

        let envelope = EventEnvelope::compile_failed("s", "msg", "", "", Some(3));
        let value: serde_json::Value =
            serde_json::from_str(&envelope.encode().expect("encode should succeed"))
                .expect("valid json");
        assert_eq!(value["data"]["line"], 3);
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let body = r#"{"kind":"render_requested","session_id":"s","data":{}}"#;
        let err = EventEnvelope::decode(body).expect_err("unknown kind must fail");
        assert!(matches!(err, Error::UnknownEventKind { kind } if kind == "render_requested"));
    }

    #[test]
    fn decode_rejects_malformed_json() {
        let err = EventEnvelope::decode("not json").expect_err("malformed input must fail");
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn decode_rejects_mismatched_payload() {
        let body = r#"{"kind":"compile_succeeded","session_id":"s","data":{"script":"x"}}"#;
        let err = EventEnvelope::decode(body).expect_err("payload mismatch must fail");
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn kind_accessor_matches_wire_discriminator() {
        for envelope in all_kinds() {
            let value: serde_json::Value =
                serde_json::from_str(&envelope.encode().expect("encode should succeed"))
                    .expect("valid json");
            assert_eq!(value["kind"], envelope.kind());
        }
    }
}
