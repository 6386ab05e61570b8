//! Postgres-backed event store implementation.
//!
//! Schema lives in `migrations/0001_init.sql` and is applied by
//! [`PostgresEventStore::migrate`].
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation on `events_pkey`) | `23505` | `DuplicateId` |
//! | Database (unique violation on `events_project_idempotency_key`) | `23505` | `DuplicateIdempotencyKey` |
//! | Database (other) | Any other | `Connectivity` |
//! | PoolClosed / Io / Tls / PoolTimedOut | N/A | `Connectivity` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//!
//! ## Thread Safety
//!
//! `PostgresEventStore` is `Send + Sync` and can be shared across tasks; the SQLx
//! pool handles connection management.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use pulse_auth::ApiKey;
use pulse_core::{ApiKeyId, EventId, ProjectId};
use pulse_events::{Event, Metadata};

use super::r#trait::{EventStore, EventStoreError};

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const IDEMPOTENCY_CONSTRAINT: &str = "events_project_idempotency_key";

const EVENT_COLUMNS: &str = r#"
    id, project_id, event_name, user_id, "timestamp", metadata,
    received_at, ip_address, user_agent, idempotency_key
"#;

/// Postgres-backed event ledger.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect and return a store over a fresh pool.
    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema (idempotent).
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Store an API key record (provisioning happens out of band; used by tooling/tests).
    #[instrument(skip(self, key), fields(api_key_id = %key.id, project_id = %key.project_id), err)]
    pub async fn insert_api_key(&self, key: &ApiKey) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, project_id, key_hash, name, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(key.id.as_uuid())
        .bind(key.project_id.as_uuid())
        .bind(&key.key_hash)
        .bind(&key.name)
        .bind(key.expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_api_key", e))?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, event),
        fields(event_id = %event.id, project_id = %event.project_id),
        err
    )]
    async fn insert(&self, event: &Event) -> Result<(), EventStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (
                id, project_id, event_name, user_id, "timestamp", metadata,
                received_at, ip_address, user_agent, idempotency_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.project_id.as_uuid())
        .bind(&event.event_name)
        .bind(&event.user_id)
        .bind(event.timestamp)
        .bind(Json(&event.metadata))
        .bind(event.received_at)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.idempotency_key)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if violated_constraint(&e).as_deref() == Some(IDEMPOTENCY_CONSTRAINT) => {
                let key = event.idempotency_key.as_deref().unwrap_or_default();
                match self.get_by_idempotency_key(&event.project_id, key).await? {
                    Some(existing) => Err(EventStoreError::DuplicateIdempotencyKey {
                        existing: Box::new(existing),
                    }),
                    None => Err(map_sqlx_error("insert_event", e)),
                }
            }
            Err(e) if violated_constraint(&e).is_some() => {
                Err(EventStoreError::DuplicateId(event.id))
            }
            Err(e) => Err(map_sqlx_error("insert_event", e)),
        }
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get_by_id(&self, id: &EventId) -> Result<Event, EventStoreError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_by_id", e))?
            .ok_or(EventStoreError::NotFound)?;

        event_from_row(&row)
    }

    #[instrument(skip(self), fields(project_id = %project_id), err)]
    async fn get_by_idempotency_key(
        &self,
        project_id: &ProjectId,
        key: &str,
    ) -> Result<Option<Event>, EventStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE project_id = $1 AND idempotency_key = $2"
        ))
        .bind(project_id.as_uuid())
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_by_idempotency_key", e))?;

        row.as_ref().map(event_from_row).transpose()
    }

    #[instrument(skip(self, key_hash), err)]
    async fn get_api_key_by_hash(&self, key_hash: &str) -> Result<ApiKey, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, key_hash, name, expires_at
            FROM api_keys
            WHERE key_hash = $1
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_api_key_by_hash", e))?
        .ok_or(EventStoreError::NotFound)?;

        Ok(ApiKey {
            id: ApiKeyId::from_uuid(row.try_get("id").map_err(decode_error)?),
            project_id: ProjectId::from_uuid(row.try_get("project_id").map_err(decode_error)?),
            key_hash: row.try_get("key_hash").map_err(decode_error)?,
            name: row.try_get("name").map_err(decode_error)?,
            expires_at: row.try_get("expires_at").map_err(decode_error)?,
        })
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn mark_queued(&self, id: &EventId) -> Result<(), EventStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET queued_at = COALESCE(queued_at, NOW())
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_queued", e))?;

        if result.rows_affected() == 0 {
            return Err(EventStoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_unqueued(
        &self,
        received_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, EventStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE queued_at IS NULL AND received_at < $1
            ORDER BY received_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(received_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_unqueued", e))?;

        rows.iter().map(event_from_row).collect()
    }
}

fn event_from_row(row: &PgRow) -> Result<Event, EventStoreError> {
    let metadata: Json<Metadata> = row.try_get("metadata").map_err(decode_error)?;
    Ok(Event {
        id: EventId::from_uuid(row.try_get("id").map_err(decode_error)?),
        project_id: ProjectId::from_uuid(row.try_get("project_id").map_err(decode_error)?),
        event_name: row.try_get("event_name").map_err(decode_error)?,
        user_id: row.try_get("user_id").map_err(decode_error)?,
        timestamp: row.try_get("timestamp").map_err(decode_error)?,
        metadata: metadata.0,
        received_at: row.try_get("received_at").map_err(decode_error)?,
        ip_address: row.try_get("ip_address").map_err(decode_error)?,
        user_agent: row.try_get("user_agent").map_err(decode_error)?,
        idempotency_key: row.try_get("idempotency_key").map_err(decode_error)?,
    })
}

fn decode_error(err: sqlx::Error) -> EventStoreError {
    EventStoreError::Serialization(format!("failed to decode row: {err}"))
}

/// Name of the unique constraint behind a `23505`, if that is what `err` is.
fn violated_constraint(err: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return Some(db_err.constraint().unwrap_or_default().to_string());
        }
    }
    None
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => EventStoreError::Connectivity(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            EventStoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::RowNotFound => EventStoreError::NotFound,
        other => EventStoreError::Connectivity(format!("{operation}: {other}")),
    }
}
