//! Engine error.

use agent_link_core::{ProtocolError, RequestId, TransportError};
use thiserror::Error;

/// Failure of an engine operation or of a pending exchange.
///
/// Errors reported by the agent inside a response are not represented here;
/// they arrive as a normal result carrying the `error` field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Not connected to agent")]
    NotConnected,
    #[error("Connecting to {0} timed out")]
    ConnectTimeout(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Failed to encode request: {0}")]
    Encode(String),
    #[error("Request {0} timed out")]
    Timeout(RequestId),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request id already pending: {0}")]
    DuplicateRequest(RequestId),
    #[error("No pending confirmation for tool '{name}' on request {request_id}")]
    ConfirmationNotFound { request_id: RequestId, name: String },
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Encode(e.to_string())
    }
}
