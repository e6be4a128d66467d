//! Inbound frame routing.
//!
//! Frames are dispatched strictly in arrival order. Each envelope carries one
//! payload variant, checked in this order:
//!
//! 1. `ToolConfirmationRequest` - tracked and published; the triggering
//!    exchange stays pending.
//! 2. `ToolCall` - published and handed to the tool bridge; the triggering
//!    exchange stays pending.
//! 3. `StreamComplete` - ends a streaming exchange.
//! 4. `Stream` - fragments appended to the exchange and published.
//! 5. Anything else resolves the pending exchange, if any, and is
//!    published as a message.
//!
//! A frame that fails to parse is reported as a protocol error event and
//! dropped; it never stops the loop.

use agent_link_core::{
    ConfirmationRequest, ErrorEvent, EventBus, EventPayload, ResponseContent, ResponseEnvelope,
    TransportError, codec,
};
use futures::StreamExt;

use crate::{
    confirmations::ConfirmationSet,
    pending::CorrelationTable,
    tools::ToolBridge,
    transport::{FrameStream, FrameWriter},
};

/// Where a frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Unparsable; dropped.
    Malformed,
    ToolConfirmation,
    /// `handled` is true when a local tool handler picked the call up.
    ToolCall { handled: bool },
    StreamComplete { resolved: bool },
    StreamFragment { pending: bool },
    /// Completed a pending exchange.
    Resolved,
    /// No exchange was waiting for it.
    Unsolicited,
}

#[derive(Clone)]
pub struct Dispatcher {
    table: CorrelationTable,
    events: EventBus,
    confirmations: ConfirmationSet,
    tools: ToolBridge,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(
        table: CorrelationTable,
        events: EventBus,
        confirmations: ConfirmationSet,
        tools: ToolBridge,
    ) -> Self {
        Self {
            table,
            events,
            confirmations,
            tools,
        }
    }

    /// Drain `stream` until the peer closes it or the transport fails.
    ///
    /// # Errors
    /// Returns the transport error that ended the stream, if any.
    pub async fn pump(
        &self,
        mut stream: FrameStream,
        writer: FrameWriter,
    ) -> Result<(), TransportError> {
        while let Some(frame) = stream.next().await {
            self.dispatch(&frame?, &writer);
        }
        Ok(())
    }

    /// Route one inbound frame.
    pub fn dispatch(&self, frame: &str, writer: &FrameWriter) -> Route {
        let envelope = match codec::decode_response(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping malformed frame: {e}");
                self.events.publish(EventPayload::Error(ErrorEvent::Protocol {
                    error: e.to_string(),
                    frame: frame.to_owned(),
                }));
                return Route::Malformed;
            }
        };

        let request_id = envelope.request_id.clone();
        tracing::debug!(%request_id, kind = envelope.response.kind(), "Inbound envelope");

        match envelope.response {
            ResponseContent::ToolConfirmationRequest {
                name,
                arguments,
                description,
            } => {
                let request = ConfirmationRequest {
                    request_id,
                    name,
                    arguments,
                    description,
                };
                self.confirmations.insert(request.clone());
                self.events
                    .publish(EventPayload::ToolConfirmationRequest(request));
                Route::ToolConfirmation
            }
            ResponseContent::ToolCall { name, arguments } => {
                self.events.publish(EventPayload::ToolCall {
                    request_id: request_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                });
                let handled = self
                    .tools
                    .invoke(request_id, name, arguments, writer.clone())
                    .is_some();
                Route::ToolCall { handled }
            }
            ResponseContent::StreamComplete { .. } => {
                let resolved = self.table.complete_stream(&request_id, envelope.clone());
                if !resolved {
                    tracing::debug!(%request_id, "Stream completion without pending exchange");
                    self.events.publish(EventPayload::Message(envelope));
                }
                Route::StreamComplete { resolved }
            }
            ResponseContent::Stream(ref chunks) => {
                let mut pending = self.table.contains(&request_id);
                for chunk in chunks {
                    pending = self.table.append_fragment(&request_id, chunk);
                    self.events.publish(EventPayload::StreamChunk {
                        request_id: request_id.clone(),
                        chunk: chunk.clone(),
                    });
                }
                Route::StreamFragment { pending }
            }
            _ => self.resolve_or_publish(envelope),
        }
    }

    fn resolve_or_publish(&self, envelope: ResponseEnvelope) -> Route {
        let resolved = self.table.resolve(&envelope.request_id, envelope.clone());
        if let Some(error) = &envelope.error {
            tracing::debug!(request_id = %envelope.request_id, "Agent reported error: {error}");
        }
        self.events.publish(EventPayload::Message(envelope));
        if resolved {
            Route::Resolved
        } else {
            Route::Unsolicited
        }
    }
}
