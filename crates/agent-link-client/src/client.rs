//! `AgentClient`: the public face of the session engine.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use agent_link_core::{
    Arguments, ClientConfig, CommandList, EventBus, EventPayload, Input, RequestConfig,
    RequestEnvelope, RequestId, codec, new_request_id, parse_command_list,
};
use futures::Stream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    confirmations::{ConfirmationSet, ToolConfirmation},
    connection::{ConnectionManager, ConnectionStatus},
    dispatch::Dispatcher,
    error::ClientError,
    pending::{CorrelationTable, Outcome, StreamEvent},
    tools::{ToolBridge, ToolHandler},
    transport::Connector,
};

/// Per-request overrides of the client configuration.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Replaces the configured request options for this request.
    pub config: Option<RequestConfig>,
    /// Ask the agent to stream its answer.
    pub stream: Option<bool>,
    pub use_tools: Option<bool>,
    /// Replaces the configured per-exchange timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }
}

/// A streaming exchange in progress.
///
/// Yields each fragment as it arrives, then `StreamEvent::Complete` with the
/// joined text. The stream ends early if the exchange fails; `finish` then
/// reports why.
pub struct ExchangeStream {
    request_id: RequestId,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    outcome: oneshot::Receiver<Outcome>,
}

impl ExchangeStream {
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the exchange to end, discarding unread fragments.
    ///
    /// # Errors
    /// Returns the failure of the exchange: timeout, connection loss or a
    /// transport error.
    pub async fn finish(self) -> Outcome {
        self.outcome
            .await
            .unwrap_or(Err(ClientError::ConnectionClosed))
    }
}

impl Stream for ExchangeStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

/// Client for one remote agent.
///
/// Cloning is cheap; clones share the connection and all state.
#[derive(Clone)]
pub struct AgentClient {
    connection: ConnectionManager,
    table: CorrelationTable,
    events: EventBus,
    confirmations: ConfirmationSet,
    tools: ToolBridge,
}

impl AgentClient {
    /// Client speaking WebSocket to `config.url()`.
    #[cfg(feature = "websocket")]
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(crate::websocket::WebSocketConnector))
    }

    /// Client using a custom transport.
    #[must_use]
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let table = CorrelationTable::new();
        let events = EventBus::new();
        let confirmations = ConfirmationSet::new();
        let tools = ToolBridge::new(events.clone());
        let dispatcher = Dispatcher::new(
            table.clone(),
            events.clone(),
            confirmations.clone(),
            tools.clone(),
        );
        let connection =
            ConnectionManager::new(config, connector, dispatcher, table.clone(), events.clone());

        Self {
            connection,
            table,
            events,
            confirmations,
            tools,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        self.connection.config()
    }

    /// # Errors
    /// See [`ConnectionManager::connect`].
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.connection.reconnect_attempts()
    }

    /// The bus carrying connection, message, stream and tool events.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Number of exchanges waiting for their terminal envelope.
    #[must_use]
    pub fn pending_exchanges(&self) -> usize {
        self.table.len()
    }

    fn envelope(
        &self,
        request_id: RequestId,
        input: Input,
        options: &RequestOptions,
        stream: bool,
    ) -> RequestEnvelope {
        let config = self.config();
        let request = options.config.as_ref().unwrap_or(&config.request);
        RequestEnvelope {
            config: Some(request.clone()),
            stream: Some(options.stream.unwrap_or(stream)),
            use_tools: Some(options.use_tools.unwrap_or(config.use_tools)),
            ..RequestEnvelope::new(request_id, input)
        }
    }

    /// Register an exchange and put its request on the wire.
    async fn open_exchange(
        &self,
        input: Input,
        options: &RequestOptions,
        sink: Option<mpsc::UnboundedSender<StreamEvent>>,
    ) -> Result<(RequestId, oneshot::Receiver<Outcome>), ClientError> {
        let writer = self.connection.writer()?;
        let request_id = new_request_id();
        let envelope = self.envelope(request_id.clone(), input, options, sink.is_some());
        let frame = codec::encode(&envelope)?;
        let timeout = options.timeout.unwrap_or(self.config().timeout);

        let outcome = self.table.register(request_id.clone(), sink, timeout)?;
        if let Err(e) = writer.send(frame).await {
            tracing::error!(%request_id, "Failed to send request: {e}");
            self.table.fail(&request_id, e.clone().into());
            return Err(e.into());
        }

        tracing::debug!(%request_id, ?timeout, "Request sent");
        Ok((request_id, outcome))
    }

    /// Send a request without registering an exchange.
    async fn notify(&self, envelope: RequestEnvelope) -> Result<RequestId, ClientError> {
        let writer = self.connection.writer()?;
        let frame = codec::encode(&envelope)?;
        writer.send(frame).await?;
        Ok(envelope.request_id)
    }

    /// Send `input` and wait for its result.
    ///
    /// # Errors
    /// Returns `NotConnected` when no connection is open. Otherwise the
    /// exchange may fail with `Timeout`, `ConnectionClosed` or `Transport`.
    /// Errors reported by the agent come back as a normal result; see
    /// [`ExchangeResult::error`](crate::ExchangeResult::error).
    pub async fn send(&self, input: Input) -> Outcome {
        self.send_with(input, RequestOptions::default()).await
    }

    /// Like [`send`](Self::send), with per-request overrides.
    ///
    /// # Errors
    /// See [`send`](Self::send).
    pub async fn send_with(&self, input: Input, options: RequestOptions) -> Outcome {
        let (_, outcome) = self.open_exchange(input, &options, None).await?;
        outcome.await.unwrap_or(Err(ClientError::ConnectionClosed))
    }

    /// # Errors
    /// See [`send`](Self::send).
    pub async fn send_text(&self, text: impl Into<String> + Send) -> Outcome {
        self.send(Input::text(text)).await
    }

    /// # Errors
    /// See [`send`](Self::send).
    pub async fn send_image(&self, data: &[u8], mime_type: Option<String>) -> Outcome {
        self.send(Input::image(data, mime_type)).await
    }

    /// # Errors
    /// See [`send`](Self::send).
    pub async fn send_instruction(
        &self,
        command: impl Into<String> + Send,
        parameters: Arguments,
    ) -> Outcome {
        self.send(Input::instruction(command, parameters)).await
    }

    /// # Errors
    /// See [`send`](Self::send).
    pub async fn send_file(
        &self,
        filename: impl Into<String> + Send,
        content_type: impl Into<String> + Send,
        data: &[u8],
    ) -> Outcome {
        self.send(Input::file(filename, content_type, data)).await
    }

    /// Ask the agent to answer its last turn again.
    ///
    /// # Errors
    /// See [`send`](Self::send).
    pub async fn regenerate(&self) -> Outcome {
        self.send(Input::Regenerate {}).await
    }

    /// Send `input` asking for a streamed answer.
    ///
    /// # Errors
    /// Returns `NotConnected` or `Transport` if the request could not be sent.
    pub async fn stream(&self, input: Input) -> Result<ExchangeStream, ClientError> {
        self.stream_with(input, RequestOptions::default()).await
    }

    /// # Errors
    /// See [`stream`](Self::stream).
    pub async fn stream_with(
        &self,
        input: Input,
        options: RequestOptions,
    ) -> Result<ExchangeStream, ClientError> {
        let (tx, events) = mpsc::unbounded_channel();
        let (request_id, outcome) = self.open_exchange(input, &options, Some(tx)).await?;
        Ok(ExchangeStream {
            request_id,
            events,
            outcome,
        })
    }

    /// # Errors
    /// See [`stream`](Self::stream).
    pub async fn stream_text(
        &self,
        text: impl Into<String> + Send,
    ) -> Result<ExchangeStream, ClientError> {
        self.stream(Input::text(text)).await
    }

    /// Ask the agent to stop whatever it is producing.
    ///
    /// Nothing is awaited: the running exchange ends through its own
    /// terminal envelope, usually `StreamComplete` with `interrupted` set.
    ///
    /// # Errors
    /// Returns `NotConnected` or `Transport` if the request could not be sent.
    pub async fn interrupt(&self) -> Result<RequestId, ClientError> {
        let envelope = RequestEnvelope {
            config: Some(self.config().request.clone()),
            ..RequestEnvelope::new(new_request_id(), Input::Interrupt {})
        };
        let request_id = self.notify(envelope).await?;
        tracing::debug!(%request_id, "Interrupt sent");
        Ok(request_id)
    }

    /// Ask the agent which commands it supports.
    ///
    /// An agent that reports an error or answers with something that is not
    /// a command list yields an empty list.
    ///
    /// # Errors
    /// Fails like [`send`](Self::send).
    pub async fn fetch_commands(&self) -> Result<CommandList, ClientError> {
        let result = self.send(Input::ListCommands {}).await?;
        if let Some(error) = result.error() {
            tracing::warn!("Agent refused command listing: {error}");
            return Ok(CommandList::default());
        }
        Ok(parse_command_list(&result.text().unwrap_or_default()))
    }

    /// Run agent tool calls through `handler`.
    pub fn set_tool_handler(&self, handler: Arc<dyn ToolHandler>) {
        self.tools.set_handler(handler);
    }

    pub fn clear_tool_handler(&self) {
        self.tools.clear_handler();
    }

    /// Tool confirmations waiting for a decision, oldest first.
    #[must_use]
    pub fn pending_confirmations(&self) -> Vec<ToolConfirmation> {
        self.confirmations.snapshot()
    }

    pub fn clear_confirmations(&self) {
        self.confirmations.clear();
    }

    /// Answer a tool confirmation request with the arguments the tool should
    /// run with, which may differ from the ones the agent proposed.
    ///
    /// The answer is sent under the request id of the confirmation request.
    /// A matching outstanding entry is removed once the answer is on the wire;
    /// answering a confirmation that is not tracked is allowed.
    ///
    /// # Errors
    /// Returns `NotConnected` or `Transport` if the answer could not be sent.
    pub async fn answer_confirmation(
        &self,
        request_id: &str,
        name: &str,
        arguments: Arguments,
        approved: bool,
        reason: Option<String>,
    ) -> Result<(), ClientError> {
        let input = Input::ToolConfirmationAnswer {
            name: name.to_owned(),
            arguments,
            approved,
            reason: reason.clone(),
        };
        self.notify(RequestEnvelope::new(request_id, input)).await?;
        if self.confirmations.answer(request_id, name, approved).is_none() {
            tracing::debug!(%request_id, tool = %name, "Answered an untracked confirmation");
        }

        tracing::info!(%request_id, tool = %name, approved, "Tool confirmation answered");
        self.events.publish(EventPayload::ToolConfirmationResponse {
            request_id: request_id.to_owned(),
            name: name.to_owned(),
            approved,
            reason,
        });
        Ok(())
    }

    /// Arguments of an outstanding confirmation, as the agent proposed them.
    fn proposed_arguments(&self, request_id: &str, name: &str) -> Result<Arguments, ClientError> {
        self.confirmations
            .get(request_id, name)
            .map(|entry| entry.request.arguments)
            .ok_or_else(|| ClientError::ConfirmationNotFound {
                request_id: request_id.to_owned(),
                name: name.to_owned(),
            })
    }

    /// Approve an outstanding confirmation with the proposed arguments.
    ///
    /// # Errors
    /// Returns `ConfirmationNotFound` if no such confirmation is outstanding,
    /// otherwise see [`answer_confirmation`](Self::answer_confirmation).
    pub async fn approve_tool(&self, request_id: &str, name: &str) -> Result<(), ClientError> {
        let arguments = self.proposed_arguments(request_id, name)?;
        self.answer_confirmation(request_id, name, arguments, true, None)
            .await
    }

    /// Reject an outstanding confirmation.
    ///
    /// # Errors
    /// Returns `ConfirmationNotFound` if no such confirmation is outstanding,
    /// otherwise see [`answer_confirmation`](Self::answer_confirmation).
    pub async fn reject_tool(
        &self,
        request_id: &str,
        name: &str,
        reason: Option<String>,
    ) -> Result<(), ClientError> {
        let arguments = self.proposed_arguments(request_id, name)?;
        self.answer_confirmation(request_id, name, arguments, false, reason)
            .await
    }
}

