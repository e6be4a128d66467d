//! Core building blocks of the agent link session engine.
//!
//! This crate has no I/O. It provides:
//! - Wire protocol types (`RequestEnvelope`, `ResponseEnvelope`)
//! - Frame codec (JSON text frames)
//! - Command discovery parsing
//! - `ClientConfig`
//! - `EventBus` - typed publish/subscribe for unsolicited events

pub mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;

pub use commands::{CommandDefinition, CommandList, ParameterSpec, parse_command_list};
pub use config::ClientConfig;
pub use error::{ProtocolError, TransportError};
pub use events::{
    ConfirmationRequest, DisconnectReason, ErrorEvent, Event, EventBus, EventKind, EventPayload,
    Subscription,
};
pub use protocol::{
    Arguments, Input, RequestConfig, RequestEnvelope, RequestId, ResponseContent,
    ResponseEnvelope, TokenUsage, new_request_id,
};
