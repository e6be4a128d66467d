//! Typed publish/subscribe for events not tied to a pending exchange.
//!
//! Two ways to listen:
//! - `subscribe` registers a callback for one `EventKind` and hands back a
//!   `Subscription`; dropping the handle deregisters the callback.
//! - `stream` yields every event as an async stream, for consumers that
//!   would rather poll than be called back.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, PoisonError, Weak},
    time::SystemTime,
};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::protocol::{Arguments, RequestId, ResponseEnvelope};

/// Capacity of the broadcast side of the bus.
const BROADCAST_CAPACITY: usize = 1024;

/// Event discriminant used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Message,
    Error,
    StreamChunk,
    ToolCall,
    ToolResult,
    ToolConfirmationRequest,
    ToolConfirmationResponse,
}

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called locally.
    Local,
    /// The agent closed the connection.
    Closed,
    /// The transport failed.
    Error(String),
}

/// Payload of an error event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorEvent {
    /// Connection-level failure.
    Transport(String),
    /// Inbound frame that could not be parsed; it has been dropped.
    Protocol { error: String, frame: String },
    /// Informational: an automatic reconnection has been scheduled.
    Reconnecting { attempt: u32, max_attempts: u32 },
}

/// A tool the agent wants a human to approve.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationRequest {
    pub request_id: RequestId,
    pub name: String,
    pub arguments: Arguments,
    pub description: Option<String>,
}

/// Event payloads, one variant per `EventKind`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Connected {
        host: String,
        port: u16,
    },
    Disconnected(DisconnectReason),
    /// Inbound envelope that completed an exchange or arrived unsolicited.
    Message(ResponseEnvelope),
    Error(ErrorEvent),
    StreamChunk {
        request_id: RequestId,
        chunk: String,
    },
    ToolCall {
        request_id: RequestId,
        name: String,
        arguments: Arguments,
    },
    /// A locally registered tool handler produced a result.
    ToolResult {
        request_id: RequestId,
        name: String,
        result: Value,
    },
    ToolConfirmationRequest(ConfirmationRequest),
    ToolConfirmationResponse {
        request_id: RequestId,
        name: String,
        approved: bool,
        reason: Option<String>,
    },
}

impl EventPayload {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connect,
            Self::Disconnected(_) => EventKind::Disconnect,
            Self::Message(_) => EventKind::Message,
            Self::Error(_) => EventKind::Error,
            Self::StreamChunk { .. } => EventKind::StreamChunk,
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::ToolResult { .. } => EventKind::ToolResult,
            Self::ToolConfirmationRequest(_) => EventKind::ToolConfirmationRequest,
            Self::ToolConfirmationResponse { .. } => EventKind::ToolConfirmationResponse,
        }
    }
}

/// A published event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp: SystemTime,
    pub payload: EventPayload,
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(u64, Listener)>>,
}

/// Event bus shared by the engine and its observers.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            sender,
        }
    }

    /// Register a callback for one kind of event.
    ///
    /// The callback stays registered for as long as the returned handle lives.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Publish an event to callbacks of its kind and to every stream.
    pub fn publish(&self, payload: EventPayload) {
        let event = Event {
            timestamp: SystemTime::now(),
            payload,
        };
        let kind = event.kind();

        // Snapshot so listeners may subscribe or unsubscribe while running.
        let listeners: Vec<Listener> = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry
                .listeners
                .get(&kind)
                .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::error!(?kind, "Event listener panicked");
            }
        }

        let _ = self.sender.send(event); // no stream subscribers is fine
    }

    /// Number of callbacks registered for a kind.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Raw receiver for every event published from now on.
    #[must_use]
    pub fn receiver(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Stream of every event published from now on.
    ///
    /// A consumer that falls too far behind skips the events it missed.
    #[must_use]
    pub fn stream(&self) -> futures::stream::BoxStream<'static, Event> {
        BroadcastStream::new(self.receiver())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }
}

/// Handle for a registered callback. Dropping it deregisters the callback.
#[must_use = "dropping a Subscription deregisters its listener"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// Deregister the callback now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = registry.listeners.get_mut(&self.kind) {
            entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter(bus: &EventBus, kind: EventKind) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let sub = bus.subscribe(kind, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[test]
    fn test_routes_by_kind() {
        let bus = EventBus::new();
        let (connects, _c) = counter(&bus, EventKind::Connect);
        let (errors, _e) = counter(&bus, EventKind::Error);

        bus.publish(EventPayload::Connected {
            host: "localhost".to_string(),
            port: 1,
        });

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_deregisters() {
        let bus = EventBus::new();
        let (count, sub) = counter(&bus, EventKind::Disconnect);
        assert_eq!(bus.listener_count(EventKind::Disconnect), 1);

        sub.unsubscribe();
        bus.publish(EventPayload::Disconnected(DisconnectReason::Local));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(EventKind::Disconnect), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let _bad = bus.subscribe(EventKind::Message, |_| panic!("listener bug"));
        let (count, _good) = counter(&bus, EventKind::Message);

        bus.publish(EventPayload::Error(ErrorEvent::Transport("x".to_string())));
        bus.publish(EventPayload::Message(ResponseEnvelope::new(
            "r1",
            crate::protocol::ResponseContent::Text("hi".to_string()),
        )));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_sees_all_kinds() {
        let bus = EventBus::new();
        let mut stream = bus.stream();

        bus.publish(EventPayload::Disconnected(DisconnectReason::Closed));
        bus.publish(EventPayload::Error(ErrorEvent::Reconnecting {
            attempt: 1,
            max_attempts: 5,
        }));

        assert_eq!(stream.next().await.unwrap().kind(), EventKind::Disconnect);
        let event = stream.next().await.unwrap();
        assert_eq!(
            event.payload,
            EventPayload::Error(ErrorEvent::Reconnecting {
                attempt: 1,
                max_attempts: 5
            })
        );
    }
}
