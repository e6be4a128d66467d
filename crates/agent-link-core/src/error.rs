//! Error taxonomy shared by the codec and the transport seam.

use thiserror::Error;

/// Inbound bytes that could not be turned into an envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Frame has an empty request id")]
    MissingRequestId,
    #[error("Frame is empty")]
    Empty,
}

/// Connection-level failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Transport I/O error: {0}")]
    Io(String),
    #[error("Transport closed")]
    Closed,
}
