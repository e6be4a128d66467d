//! WebSocket connector.

use agent_link_core::TransportError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::transport::{Channel, Connector};

/// Connects to the agent over plain WebSocket text frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Channel, TransportError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!("WebSocket connected to {url}");

        let (write, read) = socket.split();

        let sink = write
            .sink_map_err(|e| TransportError::Io(e.to_string()))
            .with(|frame: String| future::ready(Ok::<_, TransportError>(Message::text(frame))));

        let stream = read
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    // Agents occasionally send JSON as binary frames.
                    Ok(Message::Binary(data)) => {
                        Some(Ok(String::from_utf8_lossy(&data).into_owned()))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Io(e.to_string()))),
                })
            });

        Ok(Channel::new(Box::pin(sink), stream.boxed()))
    }
}
