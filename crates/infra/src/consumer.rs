//! Single-reader consumer loop for one queue partition.
//!
//! - Reads batches strictly after the persisted cursor
//! - Runs the handler for one entry at a time, in log order
//! - Retries a failing handler with backoff, then dead-letters the entry
//! - Saves the cursor once per entry, after it was handled or dead-lettered
//! - Checks the cancellation token before each read, between entries and while
//!   backing off
//! - Hands the token to the handler; a handler that stops early reports
//!   [`HandlerError::Cancelled`] and the entry stays behind the cursor
//!
//! Delivery is at-least-once: a crash between handler success and the cursor
//! save replays the entry, so handlers must tolerate duplicates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pulse_events::{
    DeadLetter, Delivery, Event, EventQueue, FormatError, Offset, PartitionId, QueueEntry,
    QueueError,
};
use pulse_rules::RuleStoreError;

use crate::queue::{CursorStore, CursorStoreError};
use crate::retry::{RetryPolicy, sleep_or_cancel};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Rules(#[from] RuleStoreError),

    #[error("{0}")]
    Failed(String),

    /// Stopped because the consumer is shutting down; the entry is redelivered.
    #[error("handler cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cursor(#[from] CursorStoreError),

    #[error("consumer task failed: {0}")]
    Task(String),
}

/// Processes one delivered event.
///
/// `token` is the consumer's shutdown signal. Long waits inside the handler
/// should observe it and return [`HandlerError::Cancelled`].
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: &Event, token: &CancellationToken) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, event: &Event, token: &CancellationToken) -> Result<(), HandlerError> {
        (**self).handle(event, token).await
    }
}

/// What a consumer did before it stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerReport {
    pub handled: u64,
    pub dead_lettered: u64,
    /// Entries read but left behind the cursor at shutdown; they are redelivered
    /// on the next start.
    pub abandoned: u64,
}

enum EntryOutcome {
    Handled,
    DeadLettered,
    Abandoned,
}

pub struct ConsumerLoop {
    partition: PartitionId,
    queue: Arc<dyn EventQueue>,
    cursors: Arc<dyn CursorStore>,
    retry: RetryPolicy,
    batch_size: usize,
    block: Duration,
    token: CancellationToken,
}

impl ConsumerLoop {
    pub fn new(
        partition: PartitionId,
        queue: Arc<dyn EventQueue>,
        cursors: Arc<dyn CursorStore>,
        token: CancellationToken,
    ) -> Self {
        Self {
            partition,
            queue,
            cursors,
            retry: RetryPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            block: DEFAULT_BLOCK,
            token,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Run until the token is cancelled.
    pub async fn run<H>(&self, handler: &H) -> Result<ConsumerReport, ConsumerError>
    where
        H: Handler + ?Sized,
    {
        let partition = self.partition;
        let mut cursor = self.cursors.load(partition).await?;
        let mut report = ConsumerReport::default();
        info!(partition, cursor = ?cursor.as_ref().map(Offset::as_str), "consumer started");

        'read: loop {
            if self.token.is_cancelled() {
                break;
            }

            let read = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                read = self.queue.read(partition, cursor.as_ref(), self.batch_size, self.block) => read,
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(partition, error = %err, "queue read failed");
                    if !sleep_or_cancel(self.retry.base_delay, &self.token).await {
                        break;
                    }
                    continue;
                }
            };

            let mut pending = entries.into_iter();
            while let Some(entry) = pending.next() {
                if self.token.is_cancelled() {
                    report.abandoned += 1 + pending.len() as u64;
                    break 'read;
                }

                match self.process_entry(handler, &entry).await {
                    EntryOutcome::Handled => report.handled += 1,
                    EntryOutcome::DeadLettered => report.dead_lettered += 1,
                    EntryOutcome::Abandoned => {
                        report.abandoned += 1 + pending.len() as u64;
                        break 'read;
                    }
                }

                self.save_cursor(&entry.offset).await;
                cursor = Some(entry.offset);
            }
        }

        info!(
            partition,
            handled = report.handled,
            dead_lettered = report.dead_lettered,
            abandoned = report.abandoned,
            "consumer stopped"
        );
        Ok(report)
    }

    /// Spawn the loop on the runtime. The handle cancels it and joins it.
    pub fn spawn<H>(self, handler: H) -> ConsumerHandle
    where
        H: Handler + 'static,
    {
        let token = self.token.clone();
        let partition = self.partition;
        let join = tokio::spawn(async move { self.run(&handler).await });
        ConsumerHandle {
            partition,
            token,
            join,
        }
    }

    async fn process_entry<H>(&self, handler: &H, entry: &QueueEntry) -> EntryOutcome
    where
        H: Handler + ?Sized,
    {
        let event = match &entry.payload {
            Delivery::Event(event) => event,
            Delivery::Malformed { error, .. } => {
                return self
                    .dead_letter(entry, 0, format!("malformed payload: {error}"))
                    .await;
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match handler.handle(event, &self.token).await {
                Ok(()) => {
                    debug!(partition = self.partition, offset = %entry.offset, event_id = %event.id, "entry handled");
                    return EntryOutcome::Handled;
                }
                Err(HandlerError::Cancelled) => {
                    info!(partition = self.partition, offset = %entry.offset, event_id = %event.id, "handler cancelled; entry left for redelivery");
                    return EntryOutcome::Abandoned;
                }
                Err(err) if self.retry.should_retry(attempt) => {
                    warn!(
                        partition = self.partition,
                        offset = %entry.offset,
                        event_id = %event.id,
                        attempt,
                        error = %err,
                        "handler failed; retrying"
                    );
                    if !sleep_or_cancel(self.retry.delay_after(attempt), &self.token).await {
                        return EntryOutcome::Abandoned;
                    }
                }
                Err(err) => return self.dead_letter(entry, attempt, err.to_string()).await,
            }
        }
    }

    /// Route to the dead-letter channel. The cursor may only pass the entry once
    /// this succeeds, so failures are retried until cancellation.
    async fn dead_letter(&self, entry: &QueueEntry, attempts: u32, reason: String) -> EntryOutcome {
        let letter = DeadLetter::for_entry(entry, attempts, reason);
        let mut tries = 0;
        loop {
            tries += 1;
            match self.queue.dead_letter(self.partition, &letter).await {
                Ok(()) => {
                    warn!(
                        partition = self.partition,
                        offset = %entry.offset,
                        attempts,
                        reason = %letter.reason,
                        "entry dead-lettered"
                    );
                    return EntryOutcome::DeadLettered;
                }
                Err(err) => {
                    error!(partition = self.partition, offset = %entry.offset, error = %err, "dead-letter write failed");
                    if !sleep_or_cancel(self.retry.delay_after(tries), &self.token).await {
                        return EntryOutcome::Abandoned;
                    }
                }
            }
        }
    }

    /// A failed save keeps the in-memory cursor moving; after a restart the
    /// entries since the last persisted offset are redelivered.
    async fn save_cursor(&self, offset: &Offset) {
        if let Err(err) = self.cursors.save(self.partition, offset).await {
            error!(partition = self.partition, offset = %offset, error = %err, "failed to persist cursor");
        }
    }
}

/// Handle to a spawned consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    partition: PartitionId,
    token: CancellationToken,
    join: JoinHandle<Result<ConsumerReport, ConsumerError>>,
}

impl ConsumerHandle {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Request shutdown and wait for the loop to stop.
    pub async fn shutdown(self) -> Result<ConsumerReport, ConsumerError> {
        self.token.cancel();
        self.join().await
    }

    /// Wait for the loop to stop on its own (its token was cancelled elsewhere).
    pub async fn join(self) -> Result<ConsumerReport, ConsumerError> {
        self.join
            .await
            .map_err(|e| ConsumerError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use pulse_core::{EventId, ProjectId};
    use pulse_events::{InMemoryEventQueue, Metadata};

    use super::*;
    use crate::queue::InMemoryCursorStore;

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Handler for FlakyHandler {
        async fn handle(
            &self,
            _event: &Event,
            _token: &CancellationToken,
        ) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(HandlerError::Failed(format!("boom #{call}")));
            }
            Ok(())
        }
    }

    fn event() -> Event {
        let now = Utc::now();
        Event {
            id: EventId::new(),
            project_id: ProjectId::new(),
            event_name: "user_signup".into(),
            user_id: None,
            timestamp: now,
            metadata: Metadata::new(),
            received_at: now,
            ip_address: None,
            user_agent: None,
            idempotency_key: None,
        }
    }

    struct Fixture {
        queue: Arc<InMemoryEventQueue>,
        cursors: Arc<InMemoryCursorStore>,
        token: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                queue: Arc::new(InMemoryEventQueue::new()),
                cursors: Arc::new(InMemoryCursorStore::new()),
                token: CancellationToken::new(),
            }
        }

        fn consumer(&self, retry: RetryPolicy) -> ConsumerLoop {
            ConsumerLoop::new(0, self.queue.clone(), self.cursors.clone(), self.token.clone())
                .with_retry(retry)
                .with_block(Duration::from_millis(20))
        }

        /// Wait until the cursor has been saved `n` times.
        async fn wait_for_saves(&self, n: usize) {
            for _ in 0..500 {
                if self.cursors.history(0).len() >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("cursor was saved {} times, expected {n}", self.cursors.history(0).len());
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn handles_in_order_and_advances_once_per_entry() {
        let f = Fixture::new();
        let mut offsets = Vec::new();
        for _ in 0..3 {
            offsets.push(f.queue.publish(&event()).await.unwrap());
        }

        let handle = f.consumer(quick_retry()).spawn(FlakyHandler::new(0));
        f.wait_for_saves(3).await;
        let report = handle.shutdown().await.unwrap();

        assert_eq!(report.handled, 3);
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(f.cursors.history(0), offsets);
    }

    #[tokio::test]
    async fn retry_success_advances_cursor_exactly_once() {
        let f = Fixture::new();
        let offset = f.queue.publish(&event()).await.unwrap();
        let handler = Arc::new(FlakyHandler::new(1));

        let handle = f.consumer(quick_retry()).spawn(handler.clone());
        f.wait_for_saves(1).await;
        let report = handle.shutdown().await.unwrap();

        assert_eq!(handler.calls(), 2);
        assert_eq!(report.handled, 1);
        assert_eq!(f.cursors.history(0), vec![offset]);
        assert!(f.queue.dead_letters(0).is_empty());
    }

    #[tokio::test]
    async fn poison_entry_is_dead_lettered_and_cursor_moves_on() {
        let f = Fixture::new();
        let poison = f.queue.publish(&event()).await.unwrap();
        let next = f.queue.publish(&event()).await.unwrap();
        // Three failures exhaust the first entry; the second succeeds.
        let handler = Arc::new(FlakyHandler::new(3));

        let handle = f.consumer(quick_retry()).spawn(handler.clone());
        f.wait_for_saves(2).await;
        let report = handle.shutdown().await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.handled, 1);
        assert_eq!(f.cursors.history(0), vec![poison.clone(), next]);

        let letters = f.queue.dead_letters(0);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].offset, poison);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].reason, "boom #3");
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered_without_running_handler() {
        let f = Fixture::new();
        f.queue.publish_raw(0, "{not json").unwrap();
        let handler = Arc::new(FlakyHandler::new(0));

        let handle = f.consumer(quick_retry()).spawn(handler.clone());
        f.wait_for_saves(1).await;
        let report = handle.shutdown().await.unwrap();

        assert_eq!(handler.calls(), 0);
        assert_eq!(report.dead_lettered, 1);
        let letters = f.queue.dead_letters(0);
        assert_eq!(letters[0].payload, "{not json");
        assert!(letters[0].reason.starts_with("malformed payload"));
    }

    #[tokio::test]
    async fn resumes_after_persisted_cursor() {
        let f = Fixture::new();
        let first = f.queue.publish(&event()).await.unwrap();
        let second = f.queue.publish(&event()).await.unwrap();
        f.cursors.save(0, &first).await.unwrap();
        let handler = Arc::new(FlakyHandler::new(0));

        let handle = f.consumer(quick_retry()).spawn(handler.clone());
        f.wait_for_saves(2).await;
        handle.shutdown().await.unwrap();

        assert_eq!(handler.calls(), 1);
        assert_eq!(f.cursors.history(0), vec![first, second]);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_abandons_without_advancing() {
        let f = Fixture::new();
        f.queue.publish(&event()).await.unwrap();
        let handler = Arc::new(FlakyHandler::new(u32::MAX));

        let handle = f
            .consumer(RetryPolicy::fixed(3, Duration::from_secs(60)))
            .spawn(handler.clone());
        for _ in 0..500 {
            if handler.calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let report = handle.shutdown().await.unwrap();

        assert_eq!(handler.calls(), 1);
        assert_eq!(report.abandoned, 1);
        assert!(f.cursors.history(0).is_empty());
        assert!(f.queue.dead_letters(0).is_empty());
    }

    /// Blocks until the consumer is cancelled, then gives up.
    struct StallingHandler {
        started: AtomicU32,
    }

    #[async_trait]
    impl Handler for StallingHandler {
        async fn handle(
            &self,
            _event: &Event,
            token: &CancellationToken,
        ) -> Result<(), HandlerError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            token.cancelled().await;
            Err(HandlerError::Cancelled)
        }
    }

    #[tokio::test]
    async fn cancelled_handler_leaves_entry_behind_the_cursor() {
        let f = Fixture::new();
        f.queue.publish(&event()).await.unwrap();
        f.queue.publish(&event()).await.unwrap();
        let handler = Arc::new(StallingHandler {
            started: AtomicU32::new(0),
        });

        let handle = f.consumer(quick_retry()).spawn(handler.clone());
        for _ in 0..500 {
            if handler.started.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let report = tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("consumer should stop once the handler gives up")
            .unwrap();

        assert_eq!(handler.started.load(Ordering::SeqCst), 1);
        assert_eq!(report.handled, 0);
        assert_eq!(report.abandoned, 2);
        assert!(f.cursors.history(0).is_empty());
        assert!(f.queue.dead_letters(0).is_empty());
    }

    #[tokio::test]
    async fn idle_consumer_stops_promptly_on_cancel() {
        let f = Fixture::new();
        let handle = f
            .consumer(quick_retry())
            .with_block(Duration::from_secs(60))
            .spawn(FlakyHandler::new(0));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let report = tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("consumer should stop without waiting for the read")
            .unwrap();
        assert_eq!(report, ConsumerReport::default());
    }
}
