//! Consumer cursor persistence.
//!
//! One cursor per partition: the offset of the last entry that was either handled
//! or dead-lettered. A consumer resumes strictly after it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::instrument;

use pulse_events::{Offset, PartitionId};

#[derive(Debug, Error)]
pub enum CursorStoreError {
    #[error("cursor store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, partition: PartitionId) -> Result<Option<Offset>, CursorStoreError>;

    async fn save(&self, partition: PartitionId, offset: &Offset) -> Result<(), CursorStoreError>;
}

#[async_trait]
impl<C> CursorStore for Arc<C>
where
    C: CursorStore + ?Sized,
{
    async fn load(&self, partition: PartitionId) -> Result<Option<Offset>, CursorStoreError> {
        (**self).load(partition).await
    }

    async fn save(&self, partition: PartitionId, offset: &Offset) -> Result<(), CursorStoreError> {
        (**self).save(partition, offset).await
    }
}

/// In-memory cursors for tests/dev. Every save is recorded so tests can assert
/// how often a cursor moved.
#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    cursors: Mutex<HashMap<PartitionId, Vec<Offset>>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every offset ever saved for `partition`, in order.
    pub fn history(&self, partition: PartitionId) -> Vec<Offset> {
        self.cursors
            .lock()
            .ok()
            .and_then(|c| c.get(&partition).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self, partition: PartitionId) -> Result<Option<Offset>, CursorStoreError> {
        let cursors = self
            .cursors
            .lock()
            .map_err(|_| CursorStoreError::Unavailable("lock poisoned".into()))?;
        Ok(cursors.get(&partition).and_then(|h| h.last().cloned()))
    }

    async fn save(&self, partition: PartitionId, offset: &Offset) -> Result<(), CursorStoreError> {
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| CursorStoreError::Unavailable("lock poisoned".into()))?;
        cursors.entry(partition).or_default().push(offset.clone());
        Ok(())
    }
}

/// Postgres-backed cursors (table `consumer_offsets`).
#[derive(Debug, Clone)]
pub struct PostgresCursorStore {
    pool: Arc<PgPool>,
}

impl PostgresCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl CursorStore for PostgresCursorStore {
    #[instrument(skip(self), err)]
    async fn load(&self, partition: PartitionId) -> Result<Option<Offset>, CursorStoreError> {
        let row = sqlx::query(
            r#"
            SELECT last_offset
            FROM consumer_offsets
            WHERE partition_id = $1
            "#,
        )
        .bind(partition as i32)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| CursorStoreError::Unavailable(e.to_string()))?;

        row.map(|row| {
            row.try_get::<String, _>("last_offset")
                .map(Offset::new)
                .map_err(|e| CursorStoreError::Unavailable(e.to_string()))
        })
        .transpose()
    }

    #[instrument(skip(self), fields(offset = %offset), err)]
    async fn save(&self, partition: PartitionId, offset: &Offset) -> Result<(), CursorStoreError> {
        sqlx::query(
            r#"
            INSERT INTO consumer_offsets (partition_id, last_offset)
            VALUES ($1, $2)
            ON CONFLICT (partition_id)
            DO UPDATE SET
                last_offset = EXCLUDED.last_offset,
                updated_at = NOW()
            "#,
        )
        .bind(partition as i32)
        .bind(offset.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| CursorStoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
