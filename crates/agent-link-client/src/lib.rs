//! Session engine for remote agents.
//!
//! One persistent connection carries many concurrent exchanges:
//! - `AgentClient` - public operations (send, stream, interrupt, commands,
//!   tool confirmations)
//! - `ConnectionManager` - connection state machine and reconnection
//! - `CorrelationTable` - pending exchanges, one timer each
//! - `Dispatcher` - routes inbound frames in arrival order
//! - `ToolBridge` - answers agent tool calls through a `ToolHandler`
//!
//! Transports plug in through `Connector`; the `websocket` feature (on by
//! default) provides `WebSocketConnector`.

pub mod client;
pub mod confirmations;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod pending;
pub mod tools;
pub mod transport;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use client::{AgentClient, ExchangeStream, RequestOptions};
pub use confirmations::{ConfirmationSet, ConfirmationStatus, ToolConfirmation};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use dispatch::{Dispatcher, Route};
pub use error::ClientError;
pub use pending::{CorrelationTable, ExchangeResult, Outcome, StreamEvent};
pub use tools::{ToolBridge, ToolError, ToolHandler, ToolRegistry};
pub use transport::{Channel, Connector, FrameSink, FrameStream, FrameWriter};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
