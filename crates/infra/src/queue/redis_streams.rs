//! Redis Streams-backed event queue (durable, at-least-once delivery).
//!
//! - **Stream key**: `<prefix>:<partition>` (one stream per partition)
//! - **Dead-letter key**: `<prefix>:<partition>:dlq`
//! - **Reads**: plain `XREAD` from the consumer's own cursor; no consumer groups,
//!   since each partition has exactly one reader that persists its cursor
//!   separately
//! - **Offsets**: Redis stream ids (`<ms>-<seq>`)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::streams::StreamReadReply;
use tracing::{instrument, warn};

use pulse_events::{
    DeadLetter, Delivery, Event, EventQueue, Offset, PartitionId, QueueEntry, QueueError,
    partition_for,
};

/// Default stream key prefix.
pub const DEFAULT_STREAM_PREFIX: &str = "pulse:events";

/// Field holding the serialized event in each stream entry.
const PAYLOAD_FIELD: &str = "event";

#[derive(Debug, Clone)]
pub struct RedisStreamsEventQueue {
    client: Arc<redis::Client>,
    prefix: String,
    partitions: u32,
}

impl RedisStreamsEventQueue {
    /// Create a new queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Stream key prefix (default: "pulse:events")
    /// * `partitions` - Number of partition streams (at least 1)
    pub fn new(
        redis_url: impl AsRef<str>,
        prefix: Option<String>,
        partitions: u32,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string()),
            partitions: partitions.max(1),
        })
    }

    pub fn stream_key(&self, partition: PartitionId) -> String {
        format!("{}:{}", self.prefix, partition)
    }

    pub fn dlq_key(&self, partition: PartitionId) -> String {
        format!("{}:{}:dlq", self.prefix, partition)
    }

    fn check_partition(&self, partition: PartitionId) -> Result<(), QueueError> {
        if partition >= self.partitions {
            return Err(QueueError::UnknownPartition(partition));
        }
        Ok(())
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }
}

/// Stream ids are `<ms>-<seq>`.
fn check_offset(offset: &Offset) -> Result<(), QueueError> {
    let valid = offset
        .as_str()
        .split_once('-')
        .is_some_and(|(ms, seq)| ms.parse::<u64>().is_ok() && seq.parse::<u64>().is_ok());
    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidOffset(offset.to_string()))
    }
}

#[async_trait]
impl EventQueue for RedisStreamsEventQueue {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    #[instrument(
        skip(self, event),
        fields(event_id = %event.id, project_id = %event.project_id),
        err
    )]
    async fn publish(&self, event: &Event) -> Result<Offset, QueueError> {
        let payload =
            serde_json::to_string(event).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let key = self.stream_key(partition_for(&event.project_id, self.partitions));

        let mut conn = self.connection().await?;
        let id: String = redis::cmd("XADD")
            .arg(&key)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;

        Ok(Offset::new(id))
    }

    #[instrument(skip(self, after), fields(after = ?after.map(Offset::as_str)), err)]
    async fn read(
        &self,
        partition: PartitionId,
        after: Option<&Offset>,
        max: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        self.check_partition(partition)?;
        if let Some(offset) = after {
            check_offset(offset)?;
        }
        let key = self.stream_key(partition);
        let start = after.map(Offset::as_str).unwrap_or("0");

        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT").arg(max.max(1));
        // BLOCK 0 would wait forever.
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&key).arg(start);

        let mut conn = self.connection().await?;
        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XREAD failed: {e}")))?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        Ok(reply
            .keys
            .into_iter()
            .filter(|stream| stream.key == key)
            .flat_map(|stream| stream.ids)
            .map(|entry| {
                let payload = match entry.get::<String>(PAYLOAD_FIELD) {
                    Some(raw) => match serde_json::from_str::<Event>(&raw) {
                        Ok(event) => Delivery::Event(event),
                        Err(e) => Delivery::Malformed {
                            raw,
                            error: e.to_string(),
                        },
                    },
                    None => Delivery::Malformed {
                        raw: String::new(),
                        error: format!("missing {PAYLOAD_FIELD} field"),
                    },
                };
                QueueEntry {
                    partition,
                    offset: Offset::new(entry.id),
                    payload,
                }
            })
            .collect())
    }

    #[instrument(skip(self, letter), fields(offset = %letter.offset), err)]
    async fn dead_letter(
        &self,
        partition: PartitionId,
        letter: &DeadLetter,
    ) -> Result<(), QueueError> {
        self.check_partition(partition)?;
        let mut conn = self.connection().await?;

        let _: String = conn
            .xadd(
                self.dlq_key(partition),
                "*",
                &[
                    ("original_offset", letter.offset.to_string()),
                    ("attempts", letter.attempts.to_string()),
                    ("reason", letter.reason.clone()),
                    ("failed_at", letter.failed_at.to_rfc3339()),
                    ("payload", letter.payload.clone()),
                ],
            )
            .await
            .map_err(|e| QueueError::Command(format!("DLQ XADD failed: {e}")))?;

        warn!(
            partition,
            offset = %letter.offset,
            attempts = letter.attempts,
            "entry sent to dead-letter stream"
        );
        Ok(())
    }
}
