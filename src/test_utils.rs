//! Test utilities for the consumer wrapper
//!
//! Mock brokers, sinks, stores and handlers. Every mock records what it was
//! asked to do so tests can assert on ordering and counts. [`LogCapture`]
//! does the same for log events.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::consumer::CancellationToken;
use crate::db::{Dependencies, DocumentStore, NotificationChannel};
use crate::error::{Error, Result};
use crate::handlers::{Handler, HandlerError};
use crate::kafka::{ErrorSink, MessageBroker};
use crate::models::{InboundMessage, TaggedEvent};

/// Handler trait object over the untyped event
pub type DynHandler = Arc<dyn Handler<TaggedEvent>>;

/// Event carrying only its discriminant
pub fn tagged_event(event_type: &str) -> TaggedEvent {
    TaggedEvent {
        event_type: event_type.to_string(),
        fields: serde_json::Map::new(),
    }
}

/// JSON message `{"type": <event_type>}` at `offset` on partition 0
pub fn tagged_message(topic: &str, offset: i64, event_type: &str) -> InboundMessage {
    InboundMessage::new(
        topic,
        0,
        offset,
        serde_json::json!({ "type": event_type }).to_string(),
    )
}

/// One observable step of a consumption run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Poll,
    Handle { handler: String, offset: i64 },
    Commit { partition: i32, offset: i64 },
}

/// Ordered record shared between a mock broker and mock handlers
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: JournalEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Committed offsets, in commit order
    pub fn commits(&self) -> Vec<i64> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                JournalEntry::Commit { offset, .. } => Some(offset),
                _ => None,
            })
            .collect()
    }

    pub fn polls(&self) -> usize {
        self.entries()
            .iter()
            .filter(|entry| matches!(entry, JournalEntry::Poll))
            .count()
    }
}

/// Handler recording the offsets it was invoked with
pub struct RecordingHandler {
    name: String,
    types: Vec<String>,
    calls: Mutex<Vec<i64>>,
    journal: Option<Journal>,
    delays: Vec<(i64, Duration)>,
    cancel_on: Option<(i64, CancellationToken)>,
}

impl RecordingHandler {
    pub fn new(name: &str, types: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            types: types.iter().map(|t| t.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
            journal: None,
            delays: Vec::new(),
            cancel_on: None,
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Sleep before handling the message at `offset`
    pub fn with_delay(mut self, offset: i64, delay: Duration) -> Self {
        self.delays.push((offset, delay));
        self
    }

    /// Cancel `token` while handling the message at `offset`
    pub fn cancel_on(mut self, offset: i64, token: CancellationToken) -> Self {
        self.cancel_on = Some((offset, token));
        self
    }

    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler<TaggedEvent> for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn allowed_types(&self) -> Vec<String> {
        self.types.clone()
    }

    async fn handle(
        &self,
        _dependencies: &Dependencies,
        _event: &TaggedEvent,
        raw: &InboundMessage,
    ) -> anyhow::Result<()> {
        if let Some((_, delay)) = self.delays.iter().find(|(offset, _)| *offset == raw.offset) {
            tokio::time::sleep(*delay).await;
        }
        if let Some((offset, token)) = &self.cancel_on {
            if *offset == raw.offset {
                token.cancel();
            }
        }

        self.calls.lock().unwrap().push(raw.offset);
        if let Some(journal) = &self.journal {
            journal.push(JournalEntry::Handle {
                handler: self.name.clone(),
                offset: raw.offset,
            });
        }
        Ok(())
    }
}

/// Handler that always fails
pub struct FailingHandler {
    name: String,
    types: Vec<String>,
    attempts: AtomicUsize,
    attributed_to: Option<String>,
}

impl FailingHandler {
    pub fn new(name: &str, types: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            types: types.iter().map(|t| t.to_string()).collect(),
            attempts: AtomicUsize::new(0),
            attributed_to: None,
        }
    }

    /// Raise a [`HandlerError`] naming `handler_name` instead of a bare error
    pub fn attributed_to(mut self, handler_name: &str) -> Self {
        self.attributed_to = Some(handler_name.to_string());
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler<TaggedEvent> for FailingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn allowed_types(&self) -> Vec<String> {
        self.types.clone()
    }

    async fn handle(
        &self,
        _dependencies: &Dependencies,
        _event: &TaggedEvent,
        _raw: &InboundMessage,
    ) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.attributed_to {
            Some(handler_name) => {
                Err(HandlerError::new("handler failed").with_handler_name(handler_name).into())
            },
            None => Err(anyhow::anyhow!("{} failed", self.name)),
        }
    }
}

/// Broker replaying scripted batches
pub struct MockBroker {
    batches: Mutex<VecDeque<Vec<InboundMessage>>>,
    journal: Journal,
    subscribed: Mutex<Vec<String>>,
    poll_limits: Mutex<Vec<usize>>,
    connected: Mutex<bool>,
    disconnects: AtomicUsize,
    cancel_when_drained: Option<CancellationToken>,
    poll_error: Option<String>,
    commit_error: Option<String>,
    connect_error: Option<String>,
}

impl MockBroker {
    pub fn new(batches: Vec<Vec<InboundMessage>>, journal: Journal) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            journal,
            subscribed: Mutex::new(Vec::new()),
            poll_limits: Mutex::new(Vec::new()),
            connected: Mutex::new(false),
            disconnects: AtomicUsize::new(0),
            cancel_when_drained: None,
            poll_error: None,
            commit_error: None,
            connect_error: None,
        }
    }

    /// Cancel `token` on the first poll after the script runs out
    pub fn cancel_when_drained(mut self, token: CancellationToken) -> Self {
        self.cancel_when_drained = Some(token);
        self
    }

    /// Fail the first poll after the script runs out
    pub fn fail_when_drained(mut self, message: &str) -> Self {
        self.poll_error = Some(message.to_string());
        self
    }

    pub fn failing_commits(mut self, message: &str) -> Self {
        self.commit_error = Some(message.to_string());
        self
    }

    pub fn failing_connect(mut self, message: &str) -> Self {
        self.connect_error = Some(message.to_string());
        self
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    /// `max_messages` argument of every poll
    pub fn poll_limits(&self) -> Vec<usize> {
        self.poll_limits.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBroker for MockBroker {
    async fn connect(&self, topics: &[String]) -> Result<()> {
        if let Some(message) = &self.connect_error {
            return Err(Error::Connection(message.clone()));
        }
        *self.subscribed.lock().unwrap() = topics.to_vec();
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    async fn poll(&self, max_messages: usize) -> Result<Vec<InboundMessage>> {
        self.journal.push(JournalEntry::Poll);
        self.poll_limits.lock().unwrap().push(max_messages);

        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(batch) => Ok(batch),
            None => {
                if let Some(message) = &self.poll_error {
                    return Err(Error::Poll(message.clone()));
                }
                if let Some(token) = &self.cancel_when_drained {
                    token.cancel();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Vec::new())
            },
        }
    }

    async fn commit(&self, message: &InboundMessage) -> Result<()> {
        if let Some(error) = &self.commit_error {
            return Err(Error::Commit(error.clone()));
        }
        self.journal.push(JournalEntry::Commit {
            partition: message.partition,
            offset: message.offset,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.connected.lock().unwrap() = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }
}

/// Error sink keeping every published event
#[derive(Default)]
pub struct MockErrorSink {
    sent: Mutex<Vec<(String, String)>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl MockErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose every send fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// `(key, payload)` pairs successfully sent
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ErrorSink for MockErrorSink {
    async fn send(&self, key: &str, payload: &str) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::kafka("error topic unavailable"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((key.to_string(), payload.to_string()));
        Ok(())
    }
}

/// Notification channel keeping every published payload
#[derive(Default)]
pub struct MockNotificationChannel {
    published: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl MockNotificationChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// `(channel, payload)` pairs successfully published
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for MockNotificationChannel {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if self.fail {
            return Err(Error::store("redis unavailable"));
        }
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}

/// Document store holding collection names in memory
#[derive(Default)]
pub struct MockDocumentStore {
    collections: Mutex<Vec<String>>,
    created: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
}

impl MockDocumentStore {
    pub fn new(existing: &[&str]) -> Self {
        Self {
            collections: Mutex::new(existing.iter().map(|c| c.to_string()).collect()),
            ..Self::default()
        }
    }

    /// Collections created through this store, in creation order
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MockDocumentStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.collections.lock().unwrap().clone())
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        if collections.iter().any(|c| c == name) {
            return Err(Error::store(format!("Collection already exists: {}", name)));
        }
        collections.push(name.to_string());
        self.created.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// One event seen by [`LogCapture`]
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: tracing::Level,
    pub message: String,
    pub fields: HashMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: HashMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let value = format!("{:?}", value);
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

/// Layer keeping every event emitted while installed
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route this thread's events into the capture until the guard drops
    pub fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events at `level` whose message is `message`
    pub fn matching(&self, level: tracing::Level, message: &str) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.level == level && event.message == message)
            .collect()
    }

    pub fn count_at(&self, level: tracing::Level) -> usize {
        self.events().iter().filter(|event| event.level == level).count()
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}
