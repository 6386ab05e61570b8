//! Partitioned, ordered event log with cursor-based reads.
//!
//! Delivery is at-least-once: the consumer owns its cursor and advances it only
//! after an entry is handled or dead-lettered, so a crash in between replays the
//! entry. Each partition is a FIFO log read by exactly one consumer; events are
//! routed to partitions by a stable hash of `project_id`, which preserves
//! per-project ordering when the consumer side is scaled out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pulse_core::ProjectId;

use crate::event::Event;

pub type PartitionId = u32;

/// Backend-defined position in a partition.
///
/// Opaque to the consumer: it is only stored in the cursor and handed back to
/// [`EventQueue::read`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset(String);

impl Offset {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What was found at an offset.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(Event),
    /// The payload could not be decoded. It is kept verbatim for the dead-letter
    /// channel instead of being skipped.
    Malformed { raw: String, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub partition: PartitionId,
    pub offset: Offset,
    pub payload: Delivery,
}

impl QueueEntry {
    /// Raw payload as it should be preserved in the dead-letter channel.
    pub fn raw_payload(&self) -> String {
        match &self.payload {
            Delivery::Event(event) => serde_json::to_string(event).unwrap_or_default(),
            Delivery::Malformed { raw, .. } => raw.clone(),
        }
    }
}

/// Metadata recorded alongside a dead-lettered entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub offset: Offset,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    pub payload: String,
}

impl DeadLetter {
    pub fn for_entry(entry: &QueueEntry, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            offset: entry.offset.clone(),
            attempts,
            reason: reason.into(),
            failed_at: Utc::now(),
            payload: entry.raw_payload(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),

    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("invalid offset {0:?}")]
    InvalidOffset(String),
}

/// Ordered, durable, partitioned log.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Number of partitions; partition ids are `0..partitions()`.
    fn partitions(&self) -> u32;

    /// Append `event` to the partition owning its project. Returns once the log
    /// has durably accepted it.
    async fn publish(&self, event: &Event) -> Result<Offset, QueueError>;

    /// Read up to `max` entries strictly after `after` (`None` = from the start).
    ///
    /// Suspends for at most `block` when nothing is available and then returns an
    /// empty batch. Callers cancel by dropping the future.
    async fn read(
        &self,
        partition: PartitionId,
        after: Option<&Offset>,
        max: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Route an entry to the partition's dead-letter channel.
    async fn dead_letter(
        &self,
        partition: PartitionId,
        letter: &DeadLetter,
    ) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> EventQueue for Arc<Q>
where
    Q: EventQueue + ?Sized,
{
    fn partitions(&self) -> u32 {
        (**self).partitions()
    }

    async fn publish(&self, event: &Event) -> Result<Offset, QueueError> {
        (**self).publish(event).await
    }

    async fn read(
        &self,
        partition: PartitionId,
        after: Option<&Offset>,
        max: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        (**self).read(partition, after, max, block).await
    }

    async fn dead_letter(
        &self,
        partition: PartitionId,
        letter: &DeadLetter,
    ) -> Result<(), QueueError> {
        (**self).dead_letter(partition, letter).await
    }
}

/// Stable partition for a project (FNV-1a over the UUID bytes).
pub fn partition_for(project_id: &ProjectId, partitions: u32) -> PartitionId {
    if partitions <= 1 {
        return 0;
    }
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in project_id.as_uuid().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % u64::from(partitions)) as PartitionId
}
