//! Ingestion: validate, store durably, then hand off to the queue.
//!
//! The store write is the commit point. Publishing is best effort: a publish
//! failure is logged and the event stays un-queued until the reconciliation
//! sweep picks it up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use pulse_core::{EventId, ProjectId};
use pulse_events::{
    BatchEventRequest, Event, EventQueue, EventRequest, ValidationError, Validator, normalize_name,
};
use pulse_observability::Metrics;

use crate::event_store::{EventStore, EventStoreError};

/// Deadline applied to each store/queue call made while ingesting.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Metric label for requests that fail validation. Their event name is client
/// input of unbounded length, so it is never used as a label.
pub const REJECTED_EVENT_LABEL: &str = "invalid";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to store event: {0}")]
    Store(#[from] EventStoreError),

    #[error("event store did not respond within {0:?}")]
    Timeout(Duration),
}

impl IngestError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "validation_failed",
            IngestError::Store(_) | IngestError::Timeout(_) => "internal_error",
        }
    }
}

/// Result of a successful ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub event: Event,
    /// `true` when the idempotency key matched an already stored event; nothing
    /// new was written.
    pub replayed: bool,
}

/// Per-item report of a batch.
#[derive(Debug)]
pub struct BatchItemResult {
    pub index: usize,
    pub outcome: Result<IngestOutcome, IngestError>,
}

impl BatchItemResult {
    pub fn event_id(&self) -> Option<EventId> {
        self.outcome.as_ref().ok().map(|o| o.event.id)
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Clone)]
pub struct IngestionService {
    store: Arc<dyn EventStore>,
    queue: Arc<dyn EventQueue>,
    validator: Validator,
    metrics: Metrics,
    io_timeout: Duration,
}

impl IngestionService {
    pub fn new(store: Arc<dyn EventStore>, queue: Arc<dyn EventQueue>, metrics: Metrics) -> Self {
        Self {
            store,
            queue,
            validator: Validator::new(),
            metrics,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Ingest one request on behalf of `project_id`.
    #[instrument(skip(self, request, ip_address, user_agent), fields(project_id = %project_id), err)]
    pub async fn ingest(
        &self,
        request: EventRequest,
        project_id: ProjectId,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<IngestOutcome, IngestError> {
        if let Err(err) = self.validator.validate(&request) {
            self.metrics.event_processed(REJECTED_EVENT_LABEL, "rejected");
            return Err(err.into());
        }
        let event_name = normalize_name(&request.event_name);

        let now = Utc::now();
        let event = Event {
            id: EventId::new(),
            project_id,
            event_name,
            user_id: request.user_id,
            timestamp: request.timestamp.unwrap_or(now),
            metadata: request.metadata.unwrap_or_default(),
            received_at: now,
            ip_address,
            user_agent,
            idempotency_key: request.idempotency_key,
        };

        match self.store_event(&event).await {
            Ok(Some(existing)) => {
                debug!(event_id = %existing.id, "idempotency key replayed");
                self.metrics.event_processed(&existing.event_name, "replayed");
                return Ok(IngestOutcome {
                    event: existing,
                    replayed: true,
                });
            }
            Ok(None) => {}
            Err(err) => {
                self.metrics.event_processed(&event.event_name, "failed");
                return Err(err);
            }
        }

        self.hand_off(&event).await;

        info!(event_id = %event.id, event_name = %event.event_name, "event accepted");
        self.metrics.event_processed(&event.event_name, "accepted");
        Ok(IngestOutcome {
            event,
            replayed: false,
        })
    }

    /// Ingest each request independently, in order. The batch bounds are checked
    /// before any item runs; after that every item gets its own result.
    pub async fn ingest_batch(
        &self,
        batch: BatchEventRequest,
        project_id: ProjectId,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<Vec<BatchItemResult>, IngestError> {
        batch.check_bounds()?;

        let mut results = Vec::with_capacity(batch.events.len());
        for (index, request) in batch.events.into_iter().enumerate() {
            let outcome = self
                .ingest(request, project_id, ip_address.clone(), user_agent.clone())
                .await;
            results.push(BatchItemResult { index, outcome });
        }
        Ok(results)
    }

    /// Insert the event. `Some(existing)` means its idempotency key was already
    /// taken in this project.
    async fn store_event(&self, event: &Event) -> Result<Option<Event>, IngestError> {
        if let Some(key) = &event.idempotency_key {
            let existing = self
                .deadline(self.store.get_by_idempotency_key(&event.project_id, key))
                .await??;
            if existing.is_some() {
                return Ok(existing);
            }
        }

        match self.deadline(self.store.insert(event)).await? {
            Ok(()) => Ok(None),
            Err(EventStoreError::DuplicateIdempotencyKey { existing }) => Ok(Some(*existing)),
            Err(err) => Err(err.into()),
        }
    }

    /// Publish and mark queued. Failures here never fail the request.
    async fn hand_off(&self, event: &Event) {
        let published = match tokio::time::timeout(self.io_timeout, self.queue.publish(event)).await
        {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("publish timed out after {:?}", self.io_timeout)),
        };

        if let Err(err) = published {
            error!(event_id = %event.id, error = %err, "publish failed; left for reconciliation");
            return;
        }

        match self.deadline(self.store.mark_queued(&event.id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event_id = %event.id, error = %err, "failed to mark event queued")
            }
            Err(err) => warn!(event_id = %event.id, error = %err, "failed to mark event queued"),
        }
    }

    async fn deadline<T>(&self, fut: impl Future<Output = T>) -> Result<T, IngestError> {
        tokio::time::timeout(self.io_timeout, fut)
            .await
            .map_err(|_| IngestError::Timeout(self.io_timeout))
    }
}
