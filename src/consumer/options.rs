//! Execution options for a consumer and for one run

use super::CancellationToken;
use crate::kafka::KafkaConfig;

/// What a handler failure does to the surrounding batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerFailurePolicy {
    /// Log the failure, keep going and commit the message
    #[default]
    Isolate,

    /// Report the failure, leave the message uncommitted and stop consuming
    AbortBatch,
}

/// Consumer execution options, fixed at construction
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Topics subscribed when a run does not name its own
    pub topics: Vec<String>,

    /// Maximum messages fetched per poll
    pub messages_per_consumption: usize,

    /// Leave offset commits to the broker client
    pub auto_commit: bool,

    /// Run the messages of a batch concurrently
    pub parallel_consumption: bool,

    pub failure_policy: HandlerFailurePolicy,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::from_config(&KafkaConfig::default())
    }
}

impl ConsumerOptions {
    pub fn from_config(config: &KafkaConfig) -> Self {
        Self {
            topics: config.topics(),
            messages_per_consumption: config.messages_per_consumption.max(1),
            auto_commit: config.auto_commit,
            parallel_consumption: config.parallel_consumption,
            failure_policy: HandlerFailurePolicy::default(),
        }
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_messages_per_consumption(mut self, count: usize) -> Self {
        self.messages_per_consumption = count.max(1);
        self
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn with_parallel_consumption(mut self, parallel: bool) -> Self {
        self.parallel_consumption = parallel;
        self
    }

    pub fn with_failure_policy(mut self, policy: HandlerFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Overrides for one call to `Consumer::run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub topics: Option<Vec<String>>,
    pub messages_per_consumption: Option<usize>,
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    pub fn messages_per_consumption(mut self, count: usize) -> Self {
        self.messages_per_consumption = Some(count);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}
