use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use pulse_auth::{ApiKey, ApiKeyLookup, LookupError};
use pulse_core::{EventId, ProjectId};
use pulse_events::Event;

/// Event store operation error.
///
/// - **DuplicateId**: the event id already exists (should never happen with UUIDv7)
/// - **DuplicateIdempotencyKey**: `(project_id, idempotency_key)` is taken; carries the
///   event that owns it
/// - **NotFound**: point lookup missed
/// - **Connectivity**: transport/storage fault
/// - **Serialization**: a stored row could not be mapped to/from the model
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("event {0} already exists")]
    DuplicateId(EventId),

    #[error("idempotency key already used by event {}", existing.id)]
    DuplicateIdempotencyKey { existing: Box<Event> },

    #[error("not found")]
    NotFound,

    #[error("store connectivity error: {0}")]
    Connectivity(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable, append-mostly event ledger.
///
/// Events are immutable once inserted; the only mutable bit is the "queued" marker
/// used by the reconciliation sweep to find events that never reached the queue.
///
/// Implementations must be safe for concurrent use without external locking.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a new event.
    ///
    /// Fails with `DuplicateId` if `event.id` exists and with
    /// `DuplicateIdempotencyKey` if another event in the project holds the same key.
    async fn insert(&self, event: &Event) -> Result<(), EventStoreError>;

    async fn get_by_id(&self, id: &EventId) -> Result<Event, EventStoreError>;

    async fn get_by_idempotency_key(
        &self,
        project_id: &ProjectId,
        key: &str,
    ) -> Result<Option<Event>, EventStoreError>;

    async fn get_api_key_by_hash(&self, key_hash: &str) -> Result<ApiKey, EventStoreError>;

    /// Record that the event reached the queue. Idempotent.
    async fn mark_queued(&self, id: &EventId) -> Result<(), EventStoreError>;

    /// Events never marked queued that were received before `received_before`,
    /// oldest first.
    async fn list_unqueued(
        &self,
        received_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn insert(&self, event: &Event) -> Result<(), EventStoreError> {
        (**self).insert(event).await
    }

    async fn get_by_id(&self, id: &EventId) -> Result<Event, EventStoreError> {
        (**self).get_by_id(id).await
    }

    async fn get_by_idempotency_key(
        &self,
        project_id: &ProjectId,
        key: &str,
    ) -> Result<Option<Event>, EventStoreError> {
        (**self).get_by_idempotency_key(project_id, key).await
    }

    async fn get_api_key_by_hash(&self, key_hash: &str) -> Result<ApiKey, EventStoreError> {
        (**self).get_api_key_by_hash(key_hash).await
    }

    async fn mark_queued(&self, id: &EventId) -> Result<(), EventStoreError> {
        (**self).mark_queued(id).await
    }

    async fn list_unqueued(
        &self,
        received_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, EventStoreError> {
        (**self).list_unqueued(received_before, limit).await
    }
}

/// Exposes an [`EventStore`]'s API key records to authentication.
#[derive(Clone)]
pub struct StoreKeyLookup {
    store: Arc<dyn EventStore>,
}

impl StoreKeyLookup {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ApiKeyLookup for StoreKeyLookup {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, LookupError> {
        match self.store.get_api_key_by_hash(key_hash).await {
            Ok(key) => Ok(Some(key)),
            Err(EventStoreError::NotFound) => Ok(None),
            Err(e) => Err(LookupError(e.to_string())),
        }
    }
}
