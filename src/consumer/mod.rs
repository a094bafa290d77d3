//! Named consumer: handler table, dependencies, broker session and error
//! reporting bundled behind one lifecycle
//!
//! ```text
//! Created -> Connected -> (Polling -> Dispatching -> Committing)* -> Cancelling -> Stopped
//! ```

mod cancel;
mod options;
mod runner;
mod state;

pub use cancel::CancellationToken;
pub use options::{ConsumerOptions, HandlerFailurePolicy, RunOptions};
pub use state::ConsumerState;

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::api::{HealthState, HealthStatus, KAFKA_COMPONENT};
use crate::config::{Config, StoreConfig};
use crate::db::{Dependencies, DependencyOptions, MongoStore, RedisChannel};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::handlers::{Handler, HandlerTable};
use crate::kafka::{ErrorProducer, ErrorReporter, ErrorSink, KafkaBroker, MessageBroker};
use crate::logging::CONSUMER_TAG;
use crate::models::EventCodec;

/// A named Kafka consumer
///
/// The name doubles as the consumer group id, the MongoDB database name and
/// the prefix of every notification channel.
pub struct Consumer<C: EventCodec> {
    name: String,
    codec: Arc<C>,
    dispatcher: Dispatcher<C::Event>,
    dependencies: Arc<Dependencies>,
    broker: Arc<dyn MessageBroker>,
    reporter: ErrorReporter<C>,
    options: ConsumerOptions,
    stores: StoreConfig,
    health: Option<Arc<HealthState>>,
    state: watch::Sender<ConsumerState>,
}

impl<C: EventCodec> Consumer<C> {
    /// Build a consumer backed by Kafka
    ///
    /// The group id is replaced by `name`. An empty error topic disables
    /// error reporting.
    pub fn new(
        name: impl Into<String>,
        handlers: Vec<Arc<dyn Handler<C::Event>>>,
        codec: C,
        config: &Config,
    ) -> Result<Self> {
        let name = name.into();
        let mut kafka = config.kafka.clone();
        kafka.group_id = name.clone();

        let error_sink: Option<Arc<dyn ErrorSink>> = if kafka.error_topic.is_empty() {
            None
        } else {
            let producer =
                ErrorProducer::new(kafka.build_producer_config(), kafka.error_topic.clone())?;
            Some(Arc::new(producer))
        };

        let options = ConsumerOptions::from_config(&kafka);
        let broker = Arc::new(KafkaBroker::new(kafka));

        Ok(
            Self::from_parts(name, handlers, codec, options, broker, error_sink)
                .with_stores(config.stores.clone()),
        )
    }

    /// Build a consumer over an arbitrary broker and error sink
    pub fn from_parts(
        name: impl Into<String>,
        handlers: Vec<Arc<dyn Handler<C::Event>>>,
        codec: C,
        options: ConsumerOptions,
        broker: Arc<dyn MessageBroker>,
        error_sink: Option<Arc<dyn ErrorSink>>,
    ) -> Self {
        let name = name.into();
        let codec = Arc::new(codec);
        let table = HandlerTable::build(handlers);
        let (state, _) = watch::channel(ConsumerState::Created);

        Self {
            dispatcher: Dispatcher::new(name.clone(), table),
            reporter: ErrorReporter::new(name.clone(), Arc::clone(&codec), error_sink),
            name,
            codec,
            dependencies: Arc::new(Dependencies::new()),
            broker,
            options,
            stores: StoreConfig::default(),
            health: None,
            state,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Dependencies) -> Self {
        self.dependencies = Arc::new(dependencies);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = broker;
        self
    }

    /// Replace the error topic destination; `None` disables reporting
    pub fn with_error_sink(mut self, error_sink: Option<Arc<dyn ErrorSink>>) -> Self {
        self.reporter = ErrorReporter::new(self.name.clone(), Arc::clone(&self.codec), error_sink);
        self
    }

    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_stores(mut self, stores: StoreConfig) -> Self {
        self.stores = stores;
        self
    }

    /// Report the broker session on `health` under the `kafka` component
    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    pub fn handlers(&self) -> &HandlerTable<C::Event> {
        self.dispatcher.table()
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Connect the requested stores and make them available to handlers
    ///
    /// Stores that are not requested keep their current value.
    pub async fn init_dependencies(&mut self, options: DependencyOptions) -> Result<()> {
        let mut dependencies = (*self.dependencies).clone();

        if options.mongo {
            let store = MongoStore::connect(&self.stores.mongodb_url, &self.name).await?;
            dependencies.mongo = Some(Arc::new(store));
        }

        if options.redis {
            let channel = RedisChannel::connect(&self.stores.redis_url).await?;
            dependencies.redis = Some(Arc::new(channel));
        }

        info!(
            consumer = %self.name,
            tags = CONSUMER_TAG,
            dependencies = ?dependencies,
            "Dependencies initialized"
        );
        self.dependencies = Arc::new(dependencies);
        Ok(())
    }

    /// Create every named collection that does not exist yet
    ///
    /// Fails with `MissingDependency` before any I/O when no document store
    /// is configured.
    pub async fn create_collections(&self, names: &[&str]) -> Result<()> {
        let store = self.dependencies.require_mongo()?;
        let existing: HashSet<String> = store.list_collections().await?.into_iter().collect();

        let mut seen = HashSet::new();
        let missing: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| !existing.contains(*name) && seen.insert(*name))
            .collect();

        futures::future::try_join_all(missing.iter().map(|name| store.create_collection(name)))
            .await?;

        if !missing.is_empty() {
            info!(
                consumer = %self.name,
                tags = CONSUMER_TAG,
                collections = ?missing,
                "Collections created"
            );
        }
        Ok(())
    }

    /// Establish the broker session and subscribe to `topics`
    pub async fn connect(&self, topics: &[String]) -> Result<()> {
        if let Err(err) = self.broker.connect(topics).await {
            error!(
                consumer = %self.name,
                tags = CONSUMER_TAG,
                error = %err,
                "Cannot connect to kafka"
            );
            self.mark_health(HealthStatus::Unhealthy, Some(err.to_string()))
                .await;
            self.set_state(ConsumerState::Stopped);
            return Err(err);
        }

        info!(
            consumer = %self.name,
            tags = CONSUMER_TAG,
            topics = ?topics,
            "Connected to kafka"
        );
        self.mark_health(HealthStatus::Healthy, None).await;
        self.set_state(ConsumerState::Connected);
        Ok(())
    }

    /// Leave the consumer group
    pub async fn disconnect(&self) -> Result<()> {
        self.broker.disconnect().await?;
        self.set_state(ConsumerState::Stopped);
        Ok(())
    }

    /// Connect, consume until cancelled or a fatal error, then disconnect
    pub async fn run(&self, options: RunOptions) -> Result<()> {
        let topics = options
            .topics
            .unwrap_or_else(|| self.options.topics.clone());
        let batch_size = options
            .messages_per_consumption
            .unwrap_or(self.options.messages_per_consumption)
            .max(1);
        let cancel = options.cancel.unwrap_or_default();

        self.connect(&topics).await?;
        let result = self.consume(batch_size, &cancel).await;

        match &result {
            Ok(()) => {
                self.mark_health(HealthStatus::Degraded, Some("consumer stopped".to_string()))
                    .await;
            },
            Err(err) => {
                error!(
                    consumer = %self.name,
                    tags = CONSUMER_TAG,
                    error = %err,
                    "Kafka stream error"
                );
                self.mark_health(HealthStatus::Unhealthy, Some(err.to_string()))
                    .await;
            },
        }

        if let Err(err) = self.disconnect().await {
            error!(
                consumer = %self.name,
                tags = CONSUMER_TAG,
                error = %err,
                "Cannot disconnect from kafka"
            );
        }
        self.set_state(ConsumerState::Stopped);

        result
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    async fn mark_health(&self, status: HealthStatus, message: Option<String>) {
        if let Some(health) = &self.health {
            health.update_component(KAFKA_COMPONENT, status, message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{JsonCodec, TaggedEvent};
    use crate::test_utils::{DynHandler, Journal, MockBroker, MockDocumentStore, RecordingHandler};

    fn consumer(broker: Arc<MockBroker>) -> Consumer<JsonCodec<TaggedEvent>> {
        Consumer::from_parts(
            "billing",
            vec![Arc::new(RecordingHandler::new("A", &["created"])) as DynHandler],
            JsonCodec::new(),
            ConsumerOptions::default().with_topics(["invoices"]),
            broker,
            None,
        )
    }

    #[tokio::test]
    async fn test_create_collections_creates_only_missing() {
        let store = Arc::new(MockDocumentStore::new(&["a"]));
        let consumer = consumer(Arc::new(MockBroker::new(Vec::new(), Journal::new())))
            .with_dependencies(Dependencies::new().with_mongo(store.clone()));

        consumer.create_collections(&["a", "b", "c", "b"]).await.unwrap();

        let mut created = store.created();
        created.sort();
        assert_eq!(created, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_create_collections_requires_mongo() {
        let consumer = consumer(Arc::new(MockBroker::new(Vec::new(), Journal::new())));

        let result = consumer.create_collections(&["a"]).await;

        assert!(matches!(result, Err(Error::MissingDependency(_))));
    }

    #[tokio::test]
    async fn test_init_dependencies_without_stores_is_noop() {
        let mut consumer = consumer(Arc::new(MockBroker::new(Vec::new(), Journal::new())));

        consumer
            .init_dependencies(DependencyOptions {
                mongo: false,
                redis: false,
            })
            .await
            .unwrap();

        assert!(consumer.dependencies().mongo.is_none());
        assert!(consumer.dependencies().redis.is_none());
    }

    #[tokio::test]
    async fn test_connect_marks_health() {
        let health = Arc::new(HealthState::new());
        let broker = Arc::new(MockBroker::new(Vec::new(), Journal::new()));
        let consumer = consumer(broker.clone()).with_health(health.clone());

        consumer.connect(&["invoices".to_string()]).await.unwrap();

        assert_eq!(consumer.state(), ConsumerState::Connected);
        assert_eq!(broker.subscribed(), vec!["invoices"]);
        let kafka = health.component(KAFKA_COMPONENT).await.unwrap();
        assert_eq!(kafka.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let health = Arc::new(HealthState::new());
        let broker = Arc::new(
            MockBroker::new(Vec::new(), Journal::new()).failing_connect("no brokers"),
        );
        let consumer = consumer(broker).with_health(health.clone());

        let result = consumer.connect(&["invoices".to_string()]).await;

        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(health.get_status().await, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_with_error_sink_enables_reporting() {
        let journal = Journal::new();
        let cancel = CancellationToken::new();
        let sink = Arc::new(crate::test_utils::MockErrorSink::new());
        let broker = Arc::new(
            MockBroker::new(
                vec![vec![crate::models::InboundMessage::new("invoices", 0, 4, "{")]],
                journal.clone(),
            )
            .cancel_when_drained(cancel.clone()),
        );
        let consumer = consumer(Arc::new(MockBroker::new(Vec::new(), Journal::new())))
            .with_broker(broker)
            .with_error_sink(Some(sink.clone()));

        consumer.consume(1, &cancel).await.unwrap();

        assert_eq!(sink.sent().len(), 1);
        assert!(journal.commits().is_empty());
    }

    #[test]
    fn test_new_consumer_state() {
        let consumer = consumer(Arc::new(MockBroker::new(Vec::new(), Journal::new())));
        assert_eq!(consumer.state(), ConsumerState::Created);
        assert_eq!(consumer.name(), "billing");
        assert_eq!(consumer.handlers().event_types(), vec!["created"]);
    }
}
