//! Frame codec: envelopes to and from JSON text frames.
//!
//! The codec knows nothing about connections or pending exchanges. It only
//! checks that a frame is well-formed JSON of the expected shape and carries
//! a non-empty request id.

use serde::Serialize;

use crate::error::ProtocolError;
use crate::protocol::{RequestEnvelope, ResponseEnvelope};

/// Serialize any envelope into a text frame.
///
/// # Errors
/// Returns error if the envelope cannot be represented as JSON.
pub fn encode<T: Serialize>(envelope: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parse an inbound frame sent by the agent.
///
/// # Errors
/// Returns error if the frame is empty, not valid JSON, not a response
/// envelope, or has an empty request id.
pub fn decode_response(frame: &str) -> Result<ResponseEnvelope, ProtocolError> {
    let frame = non_empty(frame)?;
    let envelope: ResponseEnvelope = serde_json::from_str(frame)?;
    if envelope.request_id.is_empty() {
        return Err(ProtocolError::MissingRequestId);
    }
    Ok(envelope)
}

/// Parse a frame sent by a client. Used by agent-side peers and test servers.
///
/// # Errors
/// Returns error if the frame is empty, not valid JSON, not a request
/// envelope, or has an empty request id.
pub fn decode_request(frame: &str) -> Result<RequestEnvelope, ProtocolError> {
    let frame = non_empty(frame)?;
    let envelope: RequestEnvelope = serde_json::from_str(frame)?;
    if envelope.request_id.is_empty() {
        return Err(ProtocolError::MissingRequestId);
    }
    Ok(envelope)
}

fn non_empty(frame: &str) -> Result<&str, ProtocolError> {
    let trimmed = frame.trim();
    if trimmed.is_empty() {
        Err(ProtocolError::Empty)
    } else {
        Ok(trimmed)
    }
}
