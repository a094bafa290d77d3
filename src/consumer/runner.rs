//! The consumption loop
//!
//! Poll a batch, decode and dispatch each message, commit it, repeat until
//! cancelled. Sequential batches commit message N before dispatching N+1.
//! Parallel batches run every message concurrently and wait for all of them.
//! Under [`HandlerFailurePolicy::AbortBatch`] a parallel batch holds its
//! commits until it settles, so no commit moves a partition past an aborted
//! offset.

use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error, info, Instrument};

use super::{CancellationToken, Consumer, ConsumerState, HandlerFailurePolicy};
use crate::dispatch::HandlerFailure;
use crate::error::{Error, Result};
use crate::kafka::ReportedError;
use crate::logging::{Timer, CONSUMER_TAG};
use crate::message_span;
use crate::models::{Event, EventCodec, InboundMessage};

/// What happened to one message
#[derive(Debug)]
enum MessageOutcome {
    /// Dispatched, and committed unless auto-commit is on
    Committed,

    /// Dispatched; the commit is left to the end of the batch
    Pending,

    /// Decoding failed; reported and left uncommitted
    Undecodable,

    /// A handler failed under [`HandlerFailurePolicy::AbortBatch`]
    Aborted(HandlerFailure),
}

impl<C: EventCodec> Consumer<C> {
    /// Run the loop on an established session until `cancel` is set
    ///
    /// Returns `Ok` on cancellation. Poll and commit errors end the loop;
    /// the session is left for the caller to close.
    pub async fn consume(&self, batch_size: usize, cancel: &CancellationToken) -> Result<()> {
        let batch_size = batch_size.max(1);

        loop {
            if cancel.is_cancelled() {
                self.set_state(ConsumerState::Cancelling);
                info!(
                    consumer = %self.name,
                    tags = CONSUMER_TAG,
                    "Cancellation requested, stopping consumption"
                );
                return Ok(());
            }

            self.set_state(ConsumerState::Polling);
            let batch = self.broker.poll(batch_size).await?;
            if batch.is_empty() {
                continue;
            }

            let size = batch.len();
            let timer = Timer::start("consume_batch");
            if self.options.parallel_consumption {
                self.process_parallel(batch).await?;
            } else {
                self.process_sequential(batch).await?;
            }

            debug!(
                consumer = %self.name,
                tags = CONSUMER_TAG,
                messages = size,
                duration_ms = timer.stop().as_millis() as u64,
                "Batch processed"
            );
        }
    }

    async fn process_sequential(&self, batch: Vec<InboundMessage>) -> Result<()> {
        for message in &batch {
            self.set_state(ConsumerState::Dispatching);
            if let MessageOutcome::Aborted(failure) = self.process_message(message, false).await? {
                return Err(aborted(failure));
            }
        }
        Ok(())
    }

    async fn process_parallel(&self, batch: Vec<InboundMessage>) -> Result<()> {
        self.set_state(ConsumerState::Dispatching);
        let defer_commits = self.options.failure_policy == HandlerFailurePolicy::AbortBatch;
        let outcomes = join_all(
            batch
                .iter()
                .map(|message| self.process_message(message, defer_commits)),
        )
        .await;

        // Every message has settled; surface the first commit error, then the
        // first abort.
        let settled = outcomes.into_iter().collect::<Result<Vec<_>>>()?;

        if defer_commits {
            self.set_state(ConsumerState::Committing);
            self.commit_settled(&batch, &settled).await?;
        }

        let abort = settled.into_iter().find_map(|outcome| match outcome {
            MessageOutcome::Aborted(failure) => Some(failure),
            _ => None,
        });
        match abort {
            Some(failure) => Err(aborted(failure)),
            None => Ok(()),
        }
    }

    /// Commit pending messages lying below the lowest aborted offset of their
    /// partition, in offset order
    async fn commit_settled(
        &self,
        batch: &[InboundMessage],
        settled: &[MessageOutcome],
    ) -> Result<()> {
        let mut lowest_abort: HashMap<(&str, i32), i64> = HashMap::new();
        for (message, outcome) in batch.iter().zip(settled) {
            if matches!(outcome, MessageOutcome::Aborted(_)) {
                lowest_abort
                    .entry((message.topic.as_str(), message.partition))
                    .and_modify(|offset| *offset = (*offset).min(message.offset))
                    .or_insert(message.offset);
            }
        }

        let mut pending: Vec<&InboundMessage> = batch
            .iter()
            .zip(settled)
            .filter(|(_, outcome)| matches!(outcome, MessageOutcome::Pending))
            .map(|(message, _)| message)
            .filter(|message| {
                lowest_abort
                    .get(&(message.topic.as_str(), message.partition))
                    .map_or(true, |limit| message.offset < *limit)
            })
            .collect();
        pending.sort_by(|a, b| {
            (a.topic.as_str(), a.partition, a.offset).cmp(&(b.topic.as_str(), b.partition, b.offset))
        });

        for message in pending {
            self.broker.commit(message).await?;
        }
        Ok(())
    }

    async fn process_message(
        &self,
        message: &InboundMessage,
        defer_commit: bool,
    ) -> Result<MessageOutcome> {
        let span = message_span!(self.name, message);
        self.process_in_span(message, defer_commit, span.clone())
            .instrument(span)
            .await
    }

    async fn process_in_span(
        &self,
        message: &InboundMessage,
        defer_commit: bool,
        span: tracing::Span,
    ) -> Result<MessageOutcome> {
        let timer = Timer::start("handle_message");

        let event = match self.decode(message) {
            Ok(event) => event,
            Err(err) => {
                error!(
                    consumer = %self.name,
                    tags = CONSUMER_TAG,
                    error = %err,
                    payload = %message.payload_str(),
                    "Cannot decode message"
                );
                self.reporter
                    .report(&ReportedError::from(&err), message)
                    .await;
                return Ok(MessageOutcome::Undecodable);
            },
        };
        span.record("event_type", event.event_type());

        let report = self
            .dispatcher
            .handle(&self.dependencies, &event, message)
            .await;

        if report.has_failures() && self.options.failure_policy == HandlerFailurePolicy::AbortBatch
        {
            for failure in &report.failures {
                let reported = ReportedError::new(failure.message.clone(), failure.stack.clone())
                    .with_handler_name(failure.handler_name.clone());
                self.reporter.report(&reported, message).await;
            }
            timer.stop();
            return Ok(report
                .failures
                .into_iter()
                .next()
                .map_or(MessageOutcome::Committed, MessageOutcome::Aborted));
        }

        let outcome = if self.options.auto_commit {
            MessageOutcome::Committed
        } else if defer_commit {
            MessageOutcome::Pending
        } else {
            if !self.options.parallel_consumption {
                self.set_state(ConsumerState::Committing);
            }
            self.broker.commit(message).await?;
            MessageOutcome::Committed
        };

        timer.stop();
        Ok(outcome)
    }

    fn decode(&self, message: &InboundMessage) -> Result<C::Event> {
        let value: Value = serde_json::from_slice(&message.payload)
            .map_err(|e| Error::decode(format!("Invalid JSON payload: {}", e)))?;
        self.codec.decode(value)
    }
}

fn aborted(failure: HandlerFailure) -> Error {
    Error::HandlerAborted {
        handler_name: failure.handler_name,
        message: failure.message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ConsumerOptions;
    use crate::models::{JsonCodec, TaggedEvent};
    use crate::test_utils::{
        tagged_message, DynHandler, FailingHandler, Journal, JournalEntry, MockBroker,
        MockErrorSink, RecordingHandler,
    };
    use crate::kafka::ErrorSink;
    use std::sync::Arc;
    use std::time::Duration;

    fn consumer(
        handlers: Vec<DynHandler>,
        options: ConsumerOptions,
        broker: Arc<MockBroker>,
        sink: Option<Arc<dyn ErrorSink>>,
    ) -> Consumer<JsonCodec<TaggedEvent>> {
        Consumer::from_parts("billing", handlers, JsonCodec::new(), options, broker, sink)
    }

    #[tokio::test]
    async fn test_sequential_commit_precedes_next_dispatch() {
        let journal = Journal::new();
        let cancel = CancellationToken::new();
        let handler = RecordingHandler::new("A", &["created"]).with_journal(journal.clone());
        let broker = Arc::new(
            MockBroker::new(
                vec![vec![
                    tagged_message("invoices", 10, "created"),
                    tagged_message("invoices", 11, "created"),
                ]],
                journal.clone(),
            )
            .cancel_when_drained(cancel.clone()),
        );
        let consumer = consumer(
            vec![Arc::new(handler) as DynHandler],
            ConsumerOptions::default().with_messages_per_consumption(2),
            broker,
            None,
        );

        consumer.consume(2, &cancel).await.unwrap();

        let entries: Vec<JournalEntry> = journal
            .entries()
            .into_iter()
            .filter(|e| !matches!(e, JournalEntry::Poll))
            .collect();
        assert_eq!(
            entries,
            vec![
                JournalEntry::Handle { handler: "A".to_string(), offset: 10 },
                JournalEntry::Commit { partition: 0, offset: 10 },
                JournalEntry::Handle { handler: "A".to_string(), offset: 11 },
                JournalEntry::Commit { partition: 0, offset: 11 },
            ]
        );
        assert_eq!(consumer.state(), ConsumerState::Cancelling);
    }

    #[tokio::test]
    async fn test_cancel_during_batch_finishes_batch_without_polling_again() {
        let journal = Journal::new();
        let cancel = CancellationToken::new();
        let handler = RecordingHandler::new("A", &["created"]).cancel_on(1, cancel.clone());
        let broker = Arc::new(MockBroker::new(
            vec![
                vec![
                    tagged_message("invoices", 1, "created"),
                    tagged_message("invoices", 2, "created"),
                ],
                vec![tagged_message("invoices", 3, "created")],
            ],
            journal.clone(),
        ));
        let handler = Arc::new(handler);
        let consumer = consumer(
            vec![handler.clone() as DynHandler],
            ConsumerOptions::default(),
            broker,
            None,
        );

        consumer.consume(2, &cancel).await.unwrap();

        assert_eq!(journal.polls(), 1);
        assert_eq!(handler.calls(), vec![1, 2]);
        assert_eq!(journal.commits(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_parallel_batch_commits_every_message() {
        let journal = Journal::new();
        let cancel = CancellationToken::new();
        let handler = RecordingHandler::new("A", &["created"])
            .with_delay(10, Duration::from_millis(50))
            .with_journal(journal.clone());
        let broker = Arc::new(
            MockBroker::new(
                vec![vec![
                    tagged_message("invoices", 10, "created"),
                    tagged_message("invoices", 11, "created"),
                    tagged_message("invoices", 12, "created"),
                ]],
                journal.clone(),
            )
            .cancel_when_drained(cancel.clone()),
        );
        let consumer = consumer(
            vec![Arc::new(handler) as DynHandler],
            ConsumerOptions::default().with_parallel_consumption(true),
            broker,
            None,
        );

        consumer.consume(3, &cancel).await.unwrap();

        let mut commits = journal.commits();
        // The delayed message finishes last
        assert_eq!(commits.last(), Some(&10));
        commits.sort();
        assert_eq!(commits, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_reported_and_not_committed() {
        let journal = Journal::new();
        let cancel = CancellationToken::new();
        let sink = Arc::new(MockErrorSink::new());
        let handler = Arc::new(RecordingHandler::new("A", &["created"]));
        let broker = Arc::new(
            MockBroker::new(
                vec![vec![
                    InboundMessage::new("invoices", 0, 5, "not json"),
                    tagged_message("invoices", 6, "created"),
                ]],
                journal.clone(),
            )
            .cancel_when_drained(cancel.clone()),
        );
        let consumer = consumer(
            vec![handler.clone() as DynHandler],
            ConsumerOptions::default(),
            broker,
            Some(sink.clone()),
        );

        consumer.consume(2, &cancel).await.unwrap();

        assert_eq!(journal.commits(), vec![6]);
        assert_eq!(handler.calls(), vec![6]);
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "invoices-0-5");
    }

    #[tokio::test]
    async fn test_unknown_discriminant_is_not_committed() {
        let journal = Journal::new();
        let cancel = CancellationToken::new();
        let broker = Arc::new(
            MockBroker::new(
                vec![vec![InboundMessage::new("invoices", 0, 5, r#"{"amount":3}"#)]],
                journal.clone(),
            )
            .cancel_when_drained(cancel.clone()),
        );
        let consumer = consumer(Vec::new(), ConsumerOptions::default(), broker, None);

        consumer.consume(1, &cancel).await.unwrap();

        assert!(journal.commits().is_empty());
    }

    #[tokio::test]
    async fn test_auto_commit_skips_explicit_commits() {
        let journal = Journal::new();
        let cancel = CancellationToken::new();
        let broker = Arc::new(
            MockBroker::new(
                vec![vec![tagged_message("invoices", 1, "created")]],
                journal.clone(),
            )
            .cancel_when_drained(cancel.clone()),
        );
        let handler = Arc::new(RecordingHandler::new("A", &["created"]));
        let consumer = consumer(
            vec![handler.clone() as DynHandler],
            ConsumerOptions::default().with_auto_commit(true),
            broker,
            None,
        );

        consumer.consume(1, &cancel).await.unwrap();

        assert_eq!(handler.calls(), vec![1]);
        assert!(journal.commits().is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_is_isolated_and_committed() {
        let journal = Journal::new();
        let cancel = CancellationToken::new();
        let broker = Arc::new(
            MockBroker::new(
                vec![vec![tagged_message("invoices", 1, "created")]],
                journal.clone(),
            )
            .cancel_when_drained(cancel.clone()),
        );
        let sink = Arc::new(MockErrorSink::new());
        let consumer = consumer(
            vec![Arc::new(FailingHandler::new("H", &["created"])) as DynHandler],
            ConsumerOptions::default(),
            broker,
            Some(sink.clone()),
        );

        consumer.consume(1, &cancel).await.unwrap();

        assert_eq!(journal.commits(), vec![1]);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_abort_policy_stops_without_commit() {
        let journal = Journal::new();
        let sink = Arc::new(MockErrorSink::new());
        let after = Arc::new(RecordingHandler::new("after", &["created"]));
        let broker = Arc::new(MockBroker::new(
            vec![vec![
                tagged_message("invoices", 1, "created"),
                tagged_message("invoices", 2, "created"),
            ]],
            journal.clone(),
        ));
        let consumer = consumer(
            vec![
                Arc::new(FailingHandler::new("H", &["created"]).attributed_to("ledger"))
                    as DynHandler,
                after.clone() as DynHandler,
            ],
            ConsumerOptions::default().with_failure_policy(HandlerFailurePolicy::AbortBatch),
            broker,
            Some(sink.clone()),
        );

        let result = consumer.consume(2, &CancellationToken::new()).await;

        match result {
            Err(Error::HandlerAborted { handler_name, .. }) => assert_eq!(handler_name, "ledger"),
            other => panic!("expected HandlerAborted, got {:?}", other),
        }
        assert!(journal.commits().is_empty());
        // Remaining handlers for the failing message still ran, later messages did not
        assert_eq!(after.calls(), vec![1]);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        let event: Value = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(event["handlerName"], "ledger");
    }

    #[tokio::test]
    async fn test_parallel_abort_commits_nothing_past_failed_offset() {
        let journal = Journal::new();
        let created = Arc::new(RecordingHandler::new("A", &["created"]));
        let broker = Arc::new(MockBroker::new(
            vec![vec![
                tagged_message("invoices", 1, "bad"),
                tagged_message("invoices", 2, "created"),
            ]],
            journal.clone(),
        ));
        let consumer = consumer(
            vec![
                Arc::new(FailingHandler::new("H", &["bad"])) as DynHandler,
                created.clone() as DynHandler,
            ],
            ConsumerOptions::default()
                .with_parallel_consumption(true)
                .with_failure_policy(HandlerFailurePolicy::AbortBatch),
            broker,
            None,
        );

        let result = consumer.consume(2, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::HandlerAborted { .. })));
        // Offset 2 was handled but committing it would acknowledge offset 1
        assert_eq!(created.calls(), vec![2]);
        assert!(journal.commits().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_abort_commits_below_lowest_abort_per_partition() {
        let journal = Journal::new();
        let broker = Arc::new(MockBroker::new(
            vec![vec![
                tagged_message("invoices", 3, "created"),
                tagged_message("invoices", 2, "bad"),
                tagged_message("invoices", 1, "created"),
                InboundMessage::new("invoices", 1, 7, r#"{"type":"created"}"#),
            ]],
            journal.clone(),
        ));
        let consumer = consumer(
            vec![
                Arc::new(FailingHandler::new("H", &["bad"])) as DynHandler,
                Arc::new(RecordingHandler::new("A", &["created"])) as DynHandler,
            ],
            ConsumerOptions::default()
                .with_parallel_consumption(true)
                .with_failure_policy(HandlerFailurePolicy::AbortBatch),
            broker,
            None,
        );

        let result = consumer.consume(4, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::HandlerAborted { .. })));
        let commits: Vec<JournalEntry> = journal
            .entries()
            .into_iter()
            .filter(|e| matches!(e, JournalEntry::Commit { .. }))
            .collect();
        assert_eq!(
            commits,
            vec![
                JournalEntry::Commit { partition: 0, offset: 1 },
                JournalEntry::Commit { partition: 1, offset: 7 },
            ]
        );
    }

    #[tokio::test]
    async fn test_parallel_abort_policy_commits_settled_batch_in_order() {
        let journal = Journal::new();
        let cancel = CancellationToken::new();
        let handler = RecordingHandler::new("A", &["created"])
            .with_delay(10, Duration::from_millis(50));
        let broker = Arc::new(
            MockBroker::new(
                vec![vec![
                    tagged_message("invoices", 10, "created"),
                    tagged_message("invoices", 11, "created"),
                ]],
                journal.clone(),
            )
            .cancel_when_drained(cancel.clone()),
        );
        let consumer = consumer(
            vec![Arc::new(handler) as DynHandler],
            ConsumerOptions::default()
                .with_parallel_consumption(true)
                .with_failure_policy(HandlerFailurePolicy::AbortBatch),
            broker,
            None,
        );

        consumer.consume(2, &cancel).await.unwrap();

        assert_eq!(journal.commits(), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_poll_error_is_fatal() {
        let journal = Journal::new();
        let broker = Arc::new(
            MockBroker::new(
                vec![vec![tagged_message("invoices", 1, "created")]],
                journal.clone(),
            )
            .fail_when_drained("broker gone"),
        );
        let consumer = consumer(Vec::new(), ConsumerOptions::default(), broker, None);

        let result = consumer.consume(1, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::Poll(_))));
        assert_eq!(journal.commits(), vec![1]);
    }

    #[tokio::test]
    async fn test_commit_error_is_fatal() {
        let journal = Journal::new();
        let handler = Arc::new(RecordingHandler::new("A", &["created"]));
        let broker = Arc::new(
            MockBroker::new(
                vec![vec![
                    tagged_message("invoices", 1, "created"),
                    tagged_message("invoices", 2, "created"),
                ]],
                journal.clone(),
            )
            .failing_commits("not a member of the group"),
        );
        let consumer = consumer(
            vec![handler.clone() as DynHandler],
            ConsumerOptions::default(),
            broker,
            None,
        );

        let result = consumer.consume(2, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::Commit(_))));
        assert_eq!(handler.calls(), vec![1]);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_polls() {
        let journal = Journal::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let broker = Arc::new(MockBroker::new(Vec::new(), journal.clone()));
        let consumer = consumer(Vec::new(), ConsumerOptions::default(), broker, None);

        consumer.consume(1, &cancel).await.unwrap();

        assert_eq!(journal.polls(), 0);
    }
}
