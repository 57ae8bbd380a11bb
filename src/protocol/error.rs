use std::io;

use thiserror::Error;

/// Failures at the framing and transport layer. Every variant is fatal to the
/// connection it occurred on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed header: received {received} of {expected} bytes")]
    MalformedHeader { received: usize, expected: usize },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("timed out waiting for peer")]
    Timeout,

    #[error("{field} size {value} exceeds maximum of {max}")]
    FieldOverflow {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    /// Local I/O failure while staging or streaming a payload to/from disk.
    #[error("payload IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(value: serde_json::Error) -> Self {
        ProtocolError::MalformedMetadata(value.to_string())
    }
}
