//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Frame errors
    /// A frame was truncated or its bytes could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A text field exceeds the encodable length.
    #[error("field too large: {size} bytes exceeds maximum of {max} bytes")]
    FieldTooLarge {
        /// Actual field size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The peer sent an unknown control tag, operation code or chunk header.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    // Control-plane outcomes
    /// The remote host refused the request.
    #[error("connection refused by remote host")]
    ConnectionRefused,

    /// The remote host answered with a null response.
    #[error("not found: {0}")]
    NotFound(String),

    // Transfer errors
    /// Socket or filesystem failure during an operation.
    #[error("I/O failure: {0}")]
    Io(String),

    /// The transfer was cancelled by the user.
    #[error("transfer cancelled after {transferred} bytes")]
    TransferCancelled {
        /// Bytes moved before the cancellation was observed.
        transferred: u64,
    },

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

impl ProtocolError {
    /// Whether this error is a user-initiated abort rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProtocolError::TransferCancelled { .. })
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::UnexpectedEof => ProtocolError::MalformedFrame(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}
