//! Tool call bridge.
//!
//! When the agent asks the client to run a tool, the bridge calls the
//! registered `ToolHandler` and sends the result back tagged with the
//! originating request id. The exchange that triggered the call stays
//! pending; the bridge never touches the correlation table. Failed tool
//! calls are logged and dropped, the agent owns retries.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use agent_link_core::{Arguments, EventBus, EventPayload, RequestId, ResponseEnvelope, codec};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::transport::FrameWriter;

/// Tool execution error.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("Tool execution failed: {0}")]
    Failed(String),
}

/// Executes tools on behalf of the agent.
///
/// Implement this trait to expose local capabilities to the agent.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run `name` with `arguments` and return its JSON result.
    async fn call(&self, name: &str, arguments: Arguments) -> Result<Value, ToolError>;
}

type ToolFn = Arc<dyn Fn(Arguments) -> Result<Value, ToolError> + Send + Sync>;

/// Name-keyed set of synchronous tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolFn>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tool.
    #[must_use]
    pub fn with_tool<F>(mut self, name: impl Into<String>, tool: F) -> Self
    where
        F: Fn(Arguments) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.tools.insert(name.into(), Arc::new(tool));
        self
    }

    /// Registered tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ToolHandler for ToolRegistry {
    async fn call(&self, name: &str, arguments: Arguments) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool(arguments)
    }
}

/// Routes agent tool calls to the registered handler.
#[derive(Clone)]
pub struct ToolBridge {
    handler: Arc<RwLock<Option<Arc<dyn ToolHandler>>>>,
    events: EventBus,
}

impl ToolBridge {
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            handler: Arc::new(RwLock::new(None)),
            events,
        }
    }

    /// Install the handler, replacing any previous one.
    pub fn set_handler(&self, handler: Arc<dyn ToolHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    #[must_use]
    pub fn has_handler(&self) -> bool {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run a tool call in the background and answer on `writer`.
    ///
    /// Returns `None` when no handler is installed; the call is then left to
    /// event subscribers.
    pub fn invoke(
        &self,
        request_id: RequestId,
        name: String,
        arguments: Arguments,
        writer: FrameWriter,
    ) -> Option<JoinHandle<()>> {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        let events = self.events.clone();

        Some(tokio::spawn(async move {
            let result = match handler.call(&name, arguments).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(%request_id, tool = %name, "Tool call failed: {e}");
                    return;
                }
            };

            let envelope =
                ResponseEnvelope::tool_result(request_id.clone(), name.clone(), result.clone());
            let frame = match codec::encode(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(%request_id, tool = %name, "Failed to encode tool result: {e}");
                    return;
                }
            };
            if let Err(e) = writer.send(frame).await {
                tracing::error!(%request_id, tool = %name, "Failed to send tool result: {e}");
                return;
            }

            tracing::debug!(%request_id, tool = %name, "Tool result sent");
            events.publish(EventPayload::ToolResult {
                request_id,
                name,
                result,
            });
        }))
    }
}
