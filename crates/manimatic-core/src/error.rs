//! Error types and result aliases shared across Manimatic components.
//!
//! Errors are structured for programmatic handling: the relay and the worker
//! fetch loop branch on specific variants (`NoMessages`, `QueueNotExist`,
//! `UnknownEventKind`) rather than inspecting messages.

/// The result type used throughout Manimatic.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Manimatic operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A queue transport operation failed.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the queue failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The configured queue does not exist.
    ///
    /// This is a deployment misconfiguration, not a transient fault; the
    /// worker fetch loop treats it as fatal.
    #[error("queue does not exist: {url}")]
    QueueNotExist {
        /// The queue URL that was rejected by the transport.
        url: String,
    },

    /// A long poll completed without yielding a message.
    ///
    /// Not a failure; receive loops use this to continue polling.
    #[error("no messages available")]
    NoMessages,

    /// A blob store operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An event envelope carried a `kind` outside the supported set.
    #[error("unknown event kind: {kind}")]
    UnknownEventKind {
        /// The unrecognized kind discriminator.
        kind: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new queue error with the given message.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new queue error with a source cause.
    #[must_use]
    pub fn queue_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Queue {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true when this error means an empty long poll.
    #[must_use]
    pub const fn is_no_messages(&self) -> bool {
        matches!(self, Self::NoMessages)
    }
}
