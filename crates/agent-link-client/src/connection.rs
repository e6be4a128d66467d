//! Connection lifecycle.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected | Error
//! Connected    -> Disconnected            (local disconnect)
//! Connected    -> Disconnected -> Reconnecting -> Connecting   (unexpected close)
//! ```
//!
//! Every transition into `Connecting` goes through `connect()`, which is a
//! no-op while a connection is being opened or is already open. Manual calls
//! and reconnection timers therefore share one guard.
//!
//! Each opened connection gets a fresh generation number. The reader task and
//! the reconnection timer carry the generation they were started for, so
//! anything that fires after `disconnect()` or after a newer connection has
//! been installed is ignored.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use agent_link_core::{
    ClientConfig, DisconnectReason, ErrorEvent, EventBus, EventPayload, TransportError,
};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    dispatch::Dispatcher,
    error::ClientError,
    pending::CorrelationTable,
    transport::{Channel, Connector, FrameStream, FrameWriter},
};

/// Connection status as seen by the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The last connection attempt failed. A later `connect()` may succeed.
    Error,
    /// Waiting out the delay before an automatic reconnection attempt.
    Reconnecting,
}

impl ConnectionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Link {
    writer: FrameWriter,
    reader: Option<JoinHandle<()>>,
}

impl Link {
    fn abort_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[derive(Default)]
struct State {
    attempts: u32,
    generation: u64,
    link: Option<Link>,
    reconnect: Option<JoinHandle<()>>,
}

struct Shared {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    table: CorrelationTable,
    events: EventBus,
    state: Mutex<State>,
    status: watch::Sender<ConnectionStatus>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }
        if let Some(mut link) = state.link.take() {
            link.abort_reader();
        }
    }
}

/// Owns the transport and drives reconnection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        dispatcher: Dispatcher,
        table: CorrelationTable,
        events: EventBus,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                dispatcher,
                table,
                events,
                state: Mutex::new(State::default()),
                status,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.shared.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::debug!(from = %current, to = %status, "Connection status changed");
            *current = status;
            true
        });
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Receiver that observes every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Automatic reconnection attempts made since the last successful connect.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Writer for the open connection.
    ///
    /// # Errors
    /// Returns `NotConnected` unless the status is `Connected`.
    pub fn writer(&self) -> Result<FrameWriter, ClientError> {
        let state = self.lock();
        match (&state.link, self.status()) {
            (Some(link), ConnectionStatus::Connected) => Ok(link.writer.clone()),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Open the connection.
    ///
    /// Returns immediately if a connection is already open or being opened.
    ///
    /// # Errors
    /// Returns `ConnectTimeout` if the transport does not open within the
    /// configured timeout, `Transport` if it refuses, and `ConnectionClosed`
    /// if `disconnect()` was called while the attempt was in flight.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let generation = {
            let state = self.lock();
            match self.status() {
                ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                    tracing::debug!(status = %self.status(), "Connect ignored");
                    return Ok(());
                }
                _ => self.set_status(ConnectionStatus::Connecting),
            }
            state.generation
        };

        let config = &self.shared.config;
        let url = config.url();
        tracing::info!(%url, "Connecting to agent");

        let attempt = self.shared.connector.connect(&url);
        let opened = tokio::time::timeout(config.timeout, attempt).await;
        let channel = match opened {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(self.connect_failed(generation, e.into())),
            Err(_) => {
                return Err(self.connect_failed(generation, ClientError::ConnectTimeout(url)));
            }
        };

        let Channel { sink, stream } = channel;
        let writer = FrameWriter::new(sink);
        let Some(generation) = self.install(generation, writer.clone()) else {
            tracing::debug!(%url, "Connection abandoned after disconnect");
            writer.close().await;
            return Err(ClientError::ConnectionClosed);
        };

        tracing::info!(%url, "Connected to agent");
        self.shared.events.publish(EventPayload::Connected {
            host: config.host.clone(),
            port: config.port,
        });
        self.start_reader(generation, stream, writer);
        Ok(())
    }

    /// Adopt a freshly opened channel unless the attempt went stale.
    ///
    /// Returns the generation of the new connection.
    fn install(&self, generation: u64, writer: FrameWriter) -> Option<u64> {
        let mut state = self.lock();
        if state.generation != generation {
            return None;
        }

        state.generation += 1;
        state.attempts = 0;
        cancel_timer(&mut state);
        state.link = Some(Link {
            writer,
            reader: None,
        });
        self.set_status(ConnectionStatus::Connected);
        Some(state.generation)
    }

    /// Start dispatching inbound frames. Started after the connect event so
    /// that observers see `Connect` before any message.
    fn start_reader(&self, generation: u64, stream: FrameStream, writer: FrameWriter) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        let reader = tokio::spawn(run_reader(
            Arc::downgrade(&self.shared),
            self.shared.dispatcher.clone(),
            generation,
            stream,
            writer,
        ));
        if let Some(link) = state.link.as_mut() {
            link.reader = Some(reader);
        }
    }

    fn connect_failed(&self, generation: u64, error: ClientError) -> ClientError {
        {
            let state = self.lock();
            if state.generation != generation {
                return error;
            }
            self.set_status(ConnectionStatus::Error);
        }
        tracing::error!("Failed to connect to agent: {error}");
        self.shared
            .events
            .publish(EventPayload::Error(ErrorEvent::Transport(error.to_string())));
        error
    }

    /// Close the connection and cancel any pending reconnection.
    ///
    /// Every pending exchange fails with `ConnectionClosed`. Outstanding tool
    /// confirmations are kept.
    pub async fn disconnect(&self) {
        let (link, timer, was) = {
            let mut state = self.lock();
            state.generation += 1;
            state.attempts = 0;
            let was = self.status();
            self.set_status(ConnectionStatus::Disconnected);
            (state.link.take(), state.reconnect.take(), was)
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(mut link) = link {
            link.abort_reader();
            link.writer.close().await;
        }

        let failed = self.shared.table.fail_all(&ClientError::ConnectionClosed);
        if was == ConnectionStatus::Disconnected {
            return;
        }
        tracing::info!(failed, "Disconnected from agent");
        self.shared
            .events
            .publish(EventPayload::Disconnected(DisconnectReason::Local));
    }

    /// The reader for `generation` stopped: the peer closed or the transport failed.
    fn handle_close(&self, generation: u64, error: Option<TransportError>) {
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.link = None;
            self.set_status(ConnectionStatus::Disconnected);
        }

        let reason = match &error {
            Some(e) => {
                tracing::error!("Connection to agent failed: {e}");
                DisconnectReason::Error(e.to_string())
            }
            None => {
                tracing::info!("Agent closed the connection");
                DisconnectReason::Closed
            }
        };
        self.shared.events.publish(EventPayload::Disconnected(reason));
        if let Some(e) = error {
            self.shared
                .events
                .publish(EventPayload::Error(ErrorEvent::Transport(e.to_string())));
        }

        let failed = self.shared.table.fail_all(&ClientError::ConnectionClosed);
        if failed > 0 {
            tracing::warn!(failed, "Pending requests failed by connection loss");
        }

        self.schedule_reconnect(generation);
    }

    /// Whether a timer armed for `generation` may still act.
    fn timer_is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.generation == generation && self.status() == ConnectionStatus::Reconnecting
    }

    /// Arm the reconnection timer if the attempt budget allows it.
    fn schedule_reconnect(&self, generation: u64) -> bool {
        let max_attempts = self.shared.config.reconnect_attempts;
        let attempt = {
            let mut state = self.lock();
            let idle = matches!(
                self.status(),
                ConnectionStatus::Disconnected | ConnectionStatus::Error
            );
            if state.generation != generation || !idle {
                return false;
            }
            if state.attempts >= max_attempts {
                tracing::info!(max_attempts, "Reconnection attempts exhausted");
                return false;
            }

            state.attempts += 1;
            self.set_status(ConnectionStatus::Reconnecting);
            cancel_timer(&mut state);
            state.reconnect = Some(tokio::spawn(reconnect_after(
                Arc::downgrade(&self.shared),
                self.shared.config.reconnect_delay,
                generation,
            )));
            state.attempts
        };

        tracing::info!(attempt, max_attempts, "Scheduling reconnection");
        self.shared
            .events
            .publish(EventPayload::Error(ErrorEvent::Reconnecting {
                attempt,
                max_attempts,
            }));
        true
    }
}

/// Drop the armed reconnection timer. A timer that is itself running this
/// code keeps going; it is finishing its own attempt.
fn cancel_timer(state: &mut State) {
    if let Some(timer) = state.reconnect.take() {
        if tokio::task::try_id() != Some(timer.id()) {
            timer.abort();
        }
    }
}

async fn run_reader(
    shared: Weak<Shared>,
    dispatcher: Dispatcher,
    generation: u64,
    stream: FrameStream,
    writer: FrameWriter,
) {
    let result = dispatcher.pump(stream, writer).await;
    if let Some(shared) = shared.upgrade() {
        ConnectionManager { shared }.handle_close(generation, result.err());
    }
}

async fn reconnect_after(shared: Weak<Shared>, delay: Duration, generation: u64) {
    tokio::time::sleep(delay).await;

    let Some(shared) = shared.upgrade() else {
        return;
    };
    let manager = ConnectionManager { shared };
    if !manager.timer_is_current(generation) {
        tracing::debug!("Stale reconnection timer ignored");
        return;
    }
    if let Err(e) = manager.connect().await {
        tracing::debug!("Reconnection attempt failed: {e}");
        manager.schedule_reconnect(generation);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{confirmations::ConfirmationSet, tools::ToolBridge};

    /// Connector whose attempts never finish.
    struct Hanging;

    #[async_trait]
    impl Connector for Hanging {
        async fn connect(&self, _url: &str) -> Result<Channel, TransportError> {
            std::future::pending::<Result<Channel, TransportError>>().await
        }
    }

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self, url: &str) -> Result<Channel, TransportError> {
            Err(TransportError::Connect(format!("{url}: connection refused")))
        }
    }

    fn manager(connector: Arc<dyn Connector>, config: ClientConfig) -> ConnectionManager {
        let table = CorrelationTable::new();
        let events = EventBus::new();
        let dispatcher = Dispatcher::new(
            table.clone(),
            events.clone(),
            ConfirmationSet::new(),
            ToolBridge::new(events.clone()),
        );
        ConnectionManager::new(config, connector, dispatcher, table, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_sets_error() {
        let config = ClientConfig::new("localhost", 9).with_timeout(Duration::from_secs(2));
        let manager = manager(Arc::new(Hanging), config);

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err, ClientError::ConnectTimeout("ws://localhost:9".into()));
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert!(matches!(manager.writer(), Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_refused_connect_does_not_schedule_reconnect() {
        let manager = manager(Arc::new(Refusing), ClientConfig::default());
        let mut errors = manager.shared.events.stream();

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Connect(_))));
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert_eq!(manager.reconnect_attempts(), 0);

        let event = futures::StreamExt::next(&mut errors).await.unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::Error(ErrorEvent::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_quiet() {
        let manager = manager(Arc::new(Refusing), ClientConfig::default());
        let mut status = manager.watch_status();
        manager.disconnect().await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(!status.has_changed().unwrap());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Disconnected);
    }
}
