//! In-memory event queue for tests/dev.

use std::pin::pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::event::Event;
use crate::queue::{
    DeadLetter, Delivery, EventQueue, Offset, PartitionId, QueueEntry, QueueError, partition_for,
};

#[derive(Debug, Default)]
struct Partition {
    /// Serialized payloads; the offset of `entries[i]` is `i + 1`.
    entries: Vec<String>,
    dead_letters: Vec<DeadLetter>,
}

/// In-memory partitioned log.
///
/// - Payloads are stored serialized, so reads go through the same decode path as
///   a real backend
/// - Offsets are 1-based positions rendered as decimal strings
/// - Publish failures can be injected with [`fail_next_publishes`](Self::fail_next_publishes)
#[derive(Debug)]
pub struct InMemoryEventQueue {
    partitions: Vec<Mutex<Partition>>,
    signals: Vec<Notify>,
    failing_publishes: AtomicU32,
}

impl InMemoryEventQueue {
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    pub fn with_partitions(count: u32) -> Self {
        let count = count.max(1) as usize;
        Self {
            partitions: (0..count).map(|_| Mutex::new(Partition::default())).collect(),
            signals: (0..count).map(|_| Notify::new()).collect(),
            failing_publishes: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls to `publish` fail with `QueueError::Unavailable`.
    pub fn fail_next_publishes(&self, n: u32) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Append a raw payload, bypassing serialization.
    pub fn publish_raw(
        &self,
        partition: PartitionId,
        raw: impl Into<String>,
    ) -> Result<Offset, QueueError> {
        self.append(partition, raw.into())
    }

    /// Number of entries in a partition.
    pub fn len(&self, partition: PartitionId) -> usize {
        self.partition(partition)
            .ok()
            .and_then(|p| p.lock().ok().map(|p| p.entries.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        (0..self.partitions.len() as u32).all(|p| self.len(p) == 0)
    }

    /// Snapshot of a partition's dead-letter channel.
    pub fn dead_letters(&self, partition: PartitionId) -> Vec<DeadLetter> {
        self.partition(partition)
            .ok()
            .and_then(|p| p.lock().ok().map(|p| p.dead_letters.clone()))
            .unwrap_or_default()
    }

    /// Every event currently in a partition, in log order.
    pub fn events(&self, partition: PartitionId) -> Vec<Event> {
        self.partition(partition)
            .ok()
            .and_then(|p| {
                p.lock().ok().map(|p| {
                    p.entries
                        .iter()
                        .filter_map(|raw| serde_json::from_str(raw).ok())
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    fn partition(&self, partition: PartitionId) -> Result<&Mutex<Partition>, QueueError> {
        self.partitions
            .get(partition as usize)
            .ok_or(QueueError::UnknownPartition(partition))
    }

    fn append(&self, partition: PartitionId, raw: String) -> Result<Offset, QueueError> {
        let offset = {
            let mut p = self
                .partition(partition)?
                .lock()
                .map_err(|_| QueueError::Unavailable("partition lock poisoned".into()))?;
            p.entries.push(raw);
            Offset::new(p.entries.len().to_string())
        };
        self.signals[partition as usize].notify_waiters();
        Ok(offset)
    }

    fn collect(
        &self,
        partition: PartitionId,
        start: usize,
        max: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let p = self
            .partition(partition)?
            .lock()
            .map_err(|_| QueueError::Unavailable("partition lock poisoned".into()))?;

        Ok(p.entries
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(idx, raw)| QueueEntry {
                partition,
                offset: Offset::new((idx + 1).to_string()),
                payload: match serde_json::from_str::<Event>(raw) {
                    Ok(event) => Delivery::Event(event),
                    Err(e) => Delivery::Malformed {
                        raw: raw.clone(),
                        error: e.to_string(),
                    },
                },
            })
            .collect())
    }
}

impl Default for InMemoryEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_offset(after: Option<&Offset>) -> Result<usize, QueueError> {
    match after {
        None => Ok(0),
        Some(offset) => offset
            .as_str()
            .parse::<usize>()
            .map_err(|_| QueueError::InvalidOffset(offset.to_string())),
    }
}

#[async_trait]
impl EventQueue for InMemoryEventQueue {
    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn publish(&self, event: &Event) -> Result<Offset, QueueError> {
        let injected = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(QueueError::Unavailable("injected publish failure".into()));
        }

        let payload =
            serde_json::to_string(event).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.append(partition_for(&event.project_id, self.partitions()), payload)
    }

    async fn read(
        &self,
        partition: PartitionId,
        after: Option<&Offset>,
        max: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let start = parse_offset(after)?;
        self.partition(partition)?;
        let signal = &self.signals[partition as usize];
        let deadline = Instant::now() + block;

        loop {
            // Register interest before looking so a publish in between is not missed.
            let mut notified = pin!(signal.notified());
            notified.as_mut().enable();

            let batch = self.collect(partition, start, max)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn dead_letter(
        &self,
        partition: PartitionId,
        letter: &DeadLetter,
    ) -> Result<(), QueueError> {
        let mut p = self
            .partition(partition)?
            .lock()
            .map_err(|_| QueueError::Unavailable("partition lock poisoned".into()))?;
        p.dead_letters.push(letter.clone());
        Ok(())
    }
}
