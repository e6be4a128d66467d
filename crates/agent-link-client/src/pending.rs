//! Correlation table: in-flight exchanges keyed by request id.
//!
//! Every record is removed exactly once, by whichever comes first of
//! completion, failure or its timer. Removal happens under the table lock,
//! so a late timer or a duplicate terminal frame finds nothing and is a
//! no-op.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use agent_link_core::{RequestId, ResponseContent, ResponseEnvelope, TokenUsage};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::error::ClientError;

/// Outcome delivered to the caller of an exchange.
pub type Outcome = Result<ExchangeResult, ClientError>;

/// Incremental output of a streaming exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One fragment, in arrival order.
    Fragment(String),
    /// The stream finished; carries every fragment joined.
    Complete(String),
}

/// Terminal result of an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeResult {
    /// The envelope that ended the exchange.
    pub envelope: ResponseEnvelope,
    /// Fragments accumulated before the terminal envelope, in order.
    pub fragments: Vec<String>,
}

impl ExchangeResult {
    /// Text of the answer.
    ///
    /// Streamed exchanges yield their joined fragments; otherwise the text
    /// is taken from the terminal payload.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        if !self.fragments.is_empty()
            || matches!(self.envelope.response, ResponseContent::StreamComplete { .. })
        {
            return Some(self.fragments.concat());
        }
        self.envelope.response.text()
    }

    /// Application error reported by the agent, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.envelope.error.as_deref()
    }

    /// Token usage from the envelope or from the stream terminator.
    #[must_use]
    pub fn token_usage(&self) -> Option<TokenUsage> {
        match &self.envelope.response {
            ResponseContent::StreamComplete {
                token_usage: Some(usage),
                ..
            } => Some(*usage),
            _ => self.envelope.token_usage,
        }
    }

    /// Whether a streamed answer was cut short by an interrupt.
    #[must_use]
    pub const fn interrupted(&self) -> bool {
        matches!(
            self.envelope.response,
            ResponseContent::StreamComplete {
                interrupted: true,
                ..
            }
        )
    }
}

struct PendingExchange {
    reply: oneshot::Sender<Outcome>,
    sink: Option<mpsc::UnboundedSender<StreamEvent>>,
    fragments: Vec<String>,
    timer: JoinHandle<()>,
}

impl PendingExchange {
    fn finish(self, outcome: Outcome) {
        self.timer.abort();
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.reply.send(outcome);
    }
}

type Records = Mutex<HashMap<RequestId, PendingExchange>>;

/// Table of pending exchanges.
#[derive(Clone, Default)]
pub struct CorrelationTable {
    records: Arc<Records>,
}

impl CorrelationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingExchange>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new exchange and arm its timer.
    ///
    /// The returned receiver fires exactly once with the exchange outcome.
    ///
    /// # Errors
    /// Returns `DuplicateRequest` if `request_id` is already pending.
    pub fn register(
        &self,
        request_id: RequestId,
        sink: Option<mpsc::UnboundedSender<StreamEvent>>,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Outcome>, ClientError> {
        let mut records = self.lock();
        if records.contains_key(&request_id) {
            tracing::error!(%request_id, "Request id registered twice");
            return Err(ClientError::DuplicateRequest(request_id));
        }

        let (reply, rx) = oneshot::channel();
        let timer = tokio::spawn(expire_after(
            Arc::downgrade(&self.records),
            request_id.clone(),
            timeout,
        ));

        records.insert(
            request_id,
            PendingExchange {
                reply,
                sink,
                fragments: Vec::new(),
                timer,
            },
        );
        Ok(rx)
    }

    /// Complete an exchange with a terminal envelope.
    ///
    /// Returns `false` if nothing was pending under that id.
    pub fn resolve(&self, request_id: &str, envelope: ResponseEnvelope) -> bool {
        let Some(mut record) = self.lock().remove(request_id) else {
            return false;
        };
        let fragments = std::mem::take(&mut record.fragments);
        record.finish(Ok(ExchangeResult {
            envelope,
            fragments,
        }));
        true
    }

    /// Record one stream fragment and forward it to the sink, if any.
    ///
    /// The exchange stays pending. Returns `false` if nothing was pending.
    pub fn append_fragment(&self, request_id: &str, fragment: &str) -> bool {
        let mut records = self.lock();
        let Some(record) = records.get_mut(request_id) else {
            return false;
        };
        record.fragments.push(fragment.to_owned());
        if let Some(sink) = &record.sink {
            let _ = sink.send(StreamEvent::Fragment(fragment.to_owned()));
        }
        true
    }

    /// Finish a streaming exchange on its terminal envelope.
    ///
    /// The sink receives the joined text, then the caller receives the
    /// result. Returns `false` if nothing was pending.
    pub fn complete_stream(&self, request_id: &str, envelope: ResponseEnvelope) -> bool {
        let Some(mut record) = self.lock().remove(request_id) else {
            return false;
        };
        let fragments = std::mem::take(&mut record.fragments);
        if let Some(sink) = record.sink.take() {
            let _ = sink.send(StreamEvent::Complete(fragments.concat()));
        }
        record.finish(Ok(ExchangeResult {
            envelope,
            fragments,
        }));
        true
    }

    /// Fail one exchange. Returns `false` if nothing was pending.
    pub fn fail(&self, request_id: &str, error: ClientError) -> bool {
        let Some(record) = self.lock().remove(request_id) else {
            return false;
        };
        record.finish(Err(error));
        true
    }

    /// Fail every pending exchange with the same error. Returns how many.
    pub fn fail_all(&self, error: &ClientError) -> usize {
        let drained: Vec<PendingExchange> = self.lock().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for record in drained {
            record.finish(Err(error.clone()));
        }
        count
    }

    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

async fn expire_after(records: Weak<Records>, request_id: RequestId, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let Some(records) = records.upgrade() else {
        return;
    };
    let record = records
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&request_id);

    if let Some(record) = record {
        tracing::warn!(%request_id, ?timeout, "Request timed out");
        // Dropping our own JoinHandle does not cancel this task.
        let _ = record.reply.send(Err(ClientError::Timeout(request_id)));
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    const LONG: Duration = Duration::from_secs(30);

    fn text(id: &str, body: &str) -> ResponseEnvelope {
        ResponseEnvelope::new(id, ResponseContent::Text(body.to_string()))
    }

    fn stream_complete(id: &str) -> ResponseEnvelope {
        ResponseEnvelope::new(
            id,
            ResponseContent::StreamComplete {
                token_usage: None,
                interrupted: false,
            },
        )
    }

    #[tokio::test]
    async fn test_duplicate_register_is_rejected() {
        let table = CorrelationTable::new();
        let _rx = assert_ok!(table.register("r1".into(), None, LONG));
        let err = assert_err!(table.register("r1".into(), None, LONG));
        assert_eq!(err, ClientError::DuplicateRequest("r1".into()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_register_resolve_cycles_leave_table_empty() {
        let table = CorrelationTable::new();
        for i in 0..50 {
            let id = format!("r{i}");
            let rx = table.register(id.clone(), None, LONG).unwrap();
            assert!(table.resolve(&id, text(&id, "ok")));
            let result = rx.await.unwrap().unwrap();
            assert_eq!(result.text().as_deref(), Some("ok"));
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_second_resolution_is_noop() {
        let table = CorrelationTable::new();
        let rx = table.register("r1".into(), None, LONG).unwrap();
        assert!(table.resolve("r1", text("r1", "first")));
        assert!(!table.resolve("r1", text("r1", "second")));
        assert!(!table.fail("r1", ClientError::ConnectionClosed));

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.text().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_resolved() {
        let table = CorrelationTable::new();
        assert!(!table.resolve("ghost", text("ghost", "push")));
        assert!(!table.append_fragment("ghost", "x"));
        assert!(!table.complete_stream("ghost", stream_complete("ghost")));
    }

    #[tokio::test]
    async fn test_fragments_join_on_completion() {
        let table = CorrelationTable::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let rx = table.register("r1".into(), Some(tx), LONG).unwrap();

        for chunk in ["Hel", "lo, ", "world"] {
            assert!(table.append_fragment("r1", chunk));
        }
        assert!(table.contains("r1"));
        assert!(table.complete_stream("r1", stream_complete("r1")));
        assert!(!table.complete_stream("r1", stream_complete("r1")));

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.fragments, vec!["Hel", "lo, ", "world"]);
        assert_eq!(result.text().as_deref(), Some("Hello, world"));

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                StreamEvent::Fragment("Hel".into()),
                StreamEvent::Fragment("lo, ".into()),
                StreamEvent::Fragment("world".into()),
                StreamEvent::Complete("Hello, world".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_completion_without_sink_uses_fragments() {
        let table = CorrelationTable::new();
        let rx = table.register("r1".into(), None, LONG).unwrap();
        table.append_fragment("r1", "a");
        table.append_fragment("r1", "b");
        table.complete_stream("r1", stream_complete("r1"));

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.text().as_deref(), Some("ab"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_record() {
        let table = CorrelationTable::new();
        let rx = table
            .register("r1".into(), None, Duration::from_millis(100))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(table.contains("r1"));

        let outcome = rx.await.unwrap();
        assert_eq!(outcome, Err(ClientError::Timeout("r1".into())));
        assert!(!table.contains("r1"));
        assert!(!table.resolve("r1", text("r1", "late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_cancels_timer() {
        let table = CorrelationTable::new();
        let rx = table
            .register("r1".into(), None, Duration::from_millis(100))
            .unwrap();
        table.resolve("r1", text("r1", "done"));
        assert!(rx.await.unwrap().is_ok());

        // Re-register under the same id; the old timer must not expire it.
        let rx = table
            .register("r1".into(), None, Duration::from_secs(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(table.contains("r1"));
        table.fail("r1", ClientError::ConnectionClosed);
        assert_eq!(rx.await.unwrap(), Err(ClientError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_fail_all_rejects_everything() {
        let table = CorrelationTable::new();
        let a = table.register("a".into(), None, LONG).unwrap();
        let b = table.register("b".into(), None, LONG).unwrap();

        assert_eq!(table.fail_all(&ClientError::ConnectionClosed), 2);
        assert!(table.is_empty());
        assert_eq!(a.await.unwrap(), Err(ClientError::ConnectionClosed));
        assert_eq!(b.await.unwrap(), Err(ClientError::ConnectionClosed));
    }
}
