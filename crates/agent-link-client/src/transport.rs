//! Transport seam between the engine and the wire.
//!
//! A `Connector` opens a bidirectional channel of text frames. The engine
//! never sees sockets; tests plug in in-memory channels.

use std::{pin::Pin, sync::Arc};

use agent_link_core::TransportError;
use async_trait::async_trait;
use futures::{Sink, SinkExt, stream::BoxStream};
use tokio::sync::Mutex;

/// Outbound half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a connection. Ends when the peer closes.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// An open connection, split into its two halves.
pub struct Channel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Channel {
    #[must_use]
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens connections to the agent.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`.
    async fn connect(&self, url: &str) -> Result<Channel, TransportError>;
}

/// Shared writer for one connection.
///
/// Callers on different exchanges send concurrently; the lock keeps whole
/// frames from interleaving.
#[derive(Clone)]
pub struct FrameWriter {
    sink: Arc<Mutex<FrameSink>>,
}

impl FrameWriter {
    #[must_use]
    pub fn new(sink: FrameSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Send one text frame.
    ///
    /// # Errors
    /// Returns error if the transport rejects the frame.
    pub async fn send(&self, frame: String) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(frame).await
    }

    /// Close the outbound half. Errors are logged, not returned.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!("Failed to close transport: {e}");
        }
    }
}
