#![cfg(feature = "websocket")]
//! The engine against a real WebSocket agent on the loopback interface.

use agent_link_client::{AgentClient, ClientError, ConnectionStatus, StreamEvent};
use agent_link_core::{
    ClientConfig, EventPayload, Input, ResponseContent, ResponseEnvelope, TransportError, codec,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};

type Socket = WebSocketStream<TcpStream>;

async fn reply(ws: &mut Socket, envelope: &ResponseEnvelope) {
    let frame = codec::encode(envelope).unwrap();
    ws.send(Message::text(frame)).await.unwrap();
}

/// A small echo agent: greets, echoes text, streams it back character by
/// character when asked, lists one command and rejects everything else.
async fn serve(stream: TcpStream) {
    let mut ws = accept_async(stream).await.unwrap();
    reply(
        &mut ws,
        &ResponseEnvelope::new("welcome-001", ResponseContent::Text("Welcome".into())),
    )
    .await;

    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let request = codec::decode_request(text.as_str()).unwrap();
        let id = request.request_id;

        match request.input {
            Input::Text(body) if request.stream == Some(true) => {
                for c in body.chars() {
                    let chunk = ResponseContent::Stream(vec![c.to_string()]);
                    reply(&mut ws, &ResponseEnvelope::new(id.clone(), chunk)).await;
                }
                let done = ResponseContent::StreamComplete {
                    token_usage: None,
                    interrupted: false,
                };
                reply(&mut ws, &ResponseEnvelope::new(id, done)).await;
            }
            Input::Text(body) => {
                let echo = ResponseContent::Text(format!("Echo: {body}"));
                reply(&mut ws, &ResponseEnvelope::new(id, echo)).await;
            }
            Input::ListCommands {} => {
                let listing = json!({"commands": [{"name": "echo", "description": "Echo text"}]});
                let text = ResponseContent::Text(listing.to_string());
                reply(&mut ws, &ResponseEnvelope::new(id, text)).await;
            }
            _ => {
                let mut envelope =
                    ResponseEnvelope::new(id, ResponseContent::Text("unknown input".into()));
                envelope.error = Some("unsupported_input_type".into());
                reply(&mut ws, &envelope).await;
            }
        }
    }
}

async fn spawn_agent() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream));
        }
    });
    port
}

#[tokio::test]
async fn test_echo_agent_over_websocket() {
    let port = spawn_agent().await;
    let client = AgentClient::new(ClientConfig::new("127.0.0.1", port));
    let mut events = client.events().stream();

    client.connect().await.unwrap();
    assert_eq!(client.status(), ConnectionStatus::Connected);

    // Connect, then the greeting.
    let first = events.next().await.unwrap();
    assert!(matches!(first.payload, EventPayload::Connected { port: p, .. } if p == port));
    let second = events.next().await.unwrap();
    assert!(matches!(
        second.payload,
        EventPayload::Message(envelope) if envelope.request_id == "welcome-001"
    ));

    let result = client.send_text("hello").await.unwrap();
    assert_eq!(result.text().as_deref(), Some("Echo: hello"));

    let mut stream = client.stream_text("abc").await.unwrap();
    let mut fragments = Vec::new();
    while let Some(event) = stream.next().await {
        if let StreamEvent::Fragment(fragment) = event {
            fragments.push(fragment);
        }
    }
    assert_eq!(fragments, vec!["a", "b", "c"]);
    assert_eq!(stream.finish().await.unwrap().text().as_deref(), Some("abc"));

    let commands = client.fetch_commands().await.unwrap();
    assert!(commands.find("echo").is_some());

    let rejected = client
        .send_instruction("reboot", Default::default())
        .await
        .unwrap();
    assert_eq!(rejected.error(), Some("unsupported_input_type"));

    client.disconnect().await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(client.pending_exchanges(), 0);
}

#[tokio::test]
async fn test_refused_connection_reports_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = AgentClient::new(ClientConfig::new("127.0.0.1", port));
    let err = client.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::Connect(_))
    ));
    assert_eq!(client.status(), ConnectionStatus::Error);
}
