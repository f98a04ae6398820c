//! Error types for the client.

use std::time::Duration;

use bindwire_core::{DocumentError, ExpressionError, SerializationError};

/// Why an inbound payload could not be attributed to a single message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    #[error("no declared message matches the inbound payload")]
    NoMatch,
    #[error("inbound payload matches several declared messages: {}", candidates.join(", "))]
    AmbiguousMatch { candidates: Vec<String> },
}

impl MatchError {
    /// Short label used for log fields and metric labels.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoMatch => "no_match",
            Self::AmbiguousMatch { .. } => "ambiguous_match",
        }
    }
}

/// Errors surfaced to callers of the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no binding handler supports protocol `{protocol}`")]
    UnsupportedProtocol {
        protocol: String,
        version: Option<String>,
    },

    #[error("protocol `{protocol}` is already claimed by handler `{existing}`")]
    DuplicateProtocol { protocol: String, existing: String },

    #[error("{protocol} transport failure: {source}")]
    Connection {
        protocol: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("message `{message}` failed validation: {}", errors.join("; "))]
    Validation { message: String, errors: Vec<String> },

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("channel `{channel}` needs a value for parameter `{parameter}`")]
    MissingParameter { channel: String, parameter: String },

    #[error("invalid `{protocol}` binding: {reason}")]
    InvalidBinding { protocol: String, reason: String },

    #[error("{protocol} does not support {operation}")]
    UnsupportedOperation {
        protocol: String,
        operation: &'static str,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("client has been disposed")]
    Disposed,
}

impl ClientError {
    pub(crate) fn connection(protocol: &str, source: anyhow::Error) -> Self {
        Self::Connection {
            protocol: protocol.to_string(),
            source,
        }
    }

    pub(crate) fn invalid_binding(protocol: &str, reason: impl Into<String>) -> Self {
        Self::InvalidBinding {
            protocol: protocol.to_string(),
            reason: reason.into(),
        }
    }
}

/// Binding errors reported by the document model keep their protocol tag.
pub(crate) fn binding_error(err: DocumentError) -> ClientError {
    match err {
        DocumentError::InvalidBinding { protocol, reason } => {
            ClientError::InvalidBinding { protocol, reason }
        }
        other => ClientError::Document(other),
    }
}
