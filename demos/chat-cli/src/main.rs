//! Line-oriented chat with a remote agent.
//!
//! Reads the endpoint from `AGENT_LINK_HOST` / `AGENT_LINK_PORT`, then sends
//! every stdin line as a streamed text request. Lines starting with `/` are
//! commands; `/help` lists them.

use std::io::Write;

use agent_link_client::{AgentClient, StreamEvent};
use agent_link_core::{ClientConfig, EventPayload};
use anyhow::{Context, bail};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "\
/commands                      list agent commands
/interrupt                     stop the running answer
/regenerate                    answer the last turn again
/pending                       show tool confirmations
/approve <request_id> <tool>   approve a tool
/reject <request_id> <tool> [reason]
/quit";

fn config_from_env() -> anyhow::Result<ClientConfig> {
    let mut config = ClientConfig::default();
    if let Ok(host) = std::env::var("AGENT_LINK_HOST") {
        config.host = host;
    }
    if let Ok(port) = std::env::var("AGENT_LINK_PORT") {
        config.port = port
            .parse()
            .with_context(|| format!("AGENT_LINK_PORT is not a port: {port}"))?;
    }
    Ok(config)
}

/// Print events that are not tied to the line being answered.
fn spawn_event_printer(client: &AgentClient) {
    let mut events = client.events().stream();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event.payload {
                EventPayload::ToolConfirmationRequest(request) => {
                    println!(
                        "\n[confirm] {} wants to run `{}` {}",
                        request.request_id,
                        request.name,
                        request.description.unwrap_or_default()
                    );
                }
                EventPayload::ToolCall { name, .. } => println!("\n[tool] agent called `{name}`"),
                EventPayload::Disconnected(reason) => println!("\n[disconnected] {reason:?}"),
                EventPayload::Error(error) => println!("\n[error] {error:?}"),
                _ => {}
            }
        }
    });
}

/// Stream one answer to stdout in the background so `/interrupt` stays usable.
async fn ask(client: &AgentClient, text: String) -> anyhow::Result<()> {
    let mut stream = client.stream_text(text).await?;
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Fragment(fragment) => {
                    print!("{fragment}");
                    let _ = std::io::stdout().flush();
                }
                StreamEvent::Complete(_) => println!(),
            }
        }
        match stream.finish().await {
            Ok(result) => {
                if let Some(error) = result.error() {
                    println!("[agent error] {error}");
                } else if !matches!(
                    result.envelope.response,
                    agent_link_core::ResponseContent::StreamComplete { .. }
                ) {
                    // Agents that ignore the stream flag answer in one piece.
                    println!("{}", result.text().unwrap_or_default());
                }
                if result.interrupted() {
                    println!("[interrupted]");
                }
            }
            Err(e) => println!("[failed] {e}"),
        }
    });
    Ok(())
}

async fn command(client: &AgentClient, line: &str) -> anyhow::Result<bool> {
    let mut words = line.split_whitespace();
    match words.next().unwrap_or_default() {
        "/quit" => return Ok(false),
        "/help" => println!("{HELP}"),
        "/commands" => {
            let list = client.fetch_commands().await?;
            if list.is_empty() {
                println!("(agent lists no commands)");
            }
            for command in &list.commands {
                println!("{:<16} {}", command.name, command.description);
            }
        }
        "/interrupt" => {
            client.interrupt().await?;
        }
        "/regenerate" => {
            let result = client.regenerate().await?;
            println!("{}", result.text().unwrap_or_default());
        }
        "/pending" => {
            for confirmation in client.pending_confirmations() {
                let request = &confirmation.request;
                println!("{} {} {:?}", request.request_id, request.name, request.arguments);
            }
        }
        verb @ ("/approve" | "/reject") => {
            let (Some(request_id), Some(tool)) = (words.next(), words.next()) else {
                bail!("usage: {verb} <request_id> <tool>");
            };
            if verb == "/approve" {
                client.approve_tool(request_id, tool).await?;
            } else {
                let reason: Vec<&str> = words.collect();
                let reason = (!reason.is_empty()).then(|| reason.join(" "));
                client.reject_tool(request_id, tool, reason).await?;
            }
        }
        other => println!("unknown command {other}; try /help"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = config_from_env()?;
    let url = config.url();
    let client = AgentClient::new(config);
    spawn_event_printer(&client);

    client
        .connect()
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    println!("connected to {url}; /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let outcome = if line.starts_with('/') {
            command(&client, line).await
        } else {
            ask(&client, line.to_owned()).await.map(|()| true)
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("[error] {e}"),
        }
    }

    client.disconnect().await;
    Ok(())
}
