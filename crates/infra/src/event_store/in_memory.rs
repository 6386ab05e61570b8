use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pulse_auth::ApiKey;
use pulse_core::{EventId, ProjectId};
use pulse_events::Event;

use super::r#trait::{EventStore, EventStoreError};

#[derive(Debug)]
struct StoredEvent {
    event: Event,
    queued: bool,
}

#[derive(Debug, Default)]
struct State {
    events: HashMap<EventId, StoredEvent>,
    idempotency: HashMap<(ProjectId, String), EventId>,
    api_keys: HashMap<String, ApiKey>,
}

/// In-memory event store.
///
/// Intended for tests/dev. Not optimized for performance. Insert failures can be
/// injected with [`fail_next_inserts`](Self::fail_next_inserts).
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: RwLock<State>,
    failing_inserts: AtomicU32,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an API key record.
    pub fn insert_api_key(&self, key: ApiKey) -> Result<(), EventStoreError> {
        let mut state = self.write()?;
        state.api_keys.insert(key.key_hash.clone(), key);
        Ok(())
    }

    /// Make the next `n` inserts fail with `Connectivity`.
    pub fn fail_next_inserts(&self, n: u32) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_queued(&self, id: &EventId) -> bool {
        self.state
            .read()
            .ok()
            .and_then(|s| s.events.get(id).map(|e| e.queued))
            .unwrap_or(false)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, EventStoreError> {
        self.state
            .read()
            .map_err(|_| EventStoreError::Connectivity("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, EventStoreError> {
        self.state
            .write()
            .map_err(|_| EventStoreError::Connectivity("lock poisoned".to_string()))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert(&self, event: &Event) -> Result<(), EventStoreError> {
        let injected = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EventStoreError::Connectivity("injected insert failure".into()));
        }

        let mut state = self.write()?;

        if state.events.contains_key(&event.id) {
            return Err(EventStoreError::DuplicateId(event.id));
        }

        if let Some(key) = &event.idempotency_key {
            let slot = (event.project_id, key.clone());
            if let Some(existing) = state
                .idempotency
                .get(&slot)
                .and_then(|id| state.events.get(id))
            {
                return Err(EventStoreError::DuplicateIdempotencyKey {
                    existing: Box::new(existing.event.clone()),
                });
            }
            state.idempotency.insert(slot, event.id);
        }

        state.events.insert(
            event.id,
            StoredEvent {
                event: event.clone(),
                queued: false,
            },
        );
        Ok(())
    }

    async fn get_by_id(&self, id: &EventId) -> Result<Event, EventStoreError> {
        self.read()?
            .events
            .get(id)
            .map(|e| e.event.clone())
            .ok_or(EventStoreError::NotFound)
    }

    async fn get_by_idempotency_key(
        &self,
        project_id: &ProjectId,
        key: &str,
    ) -> Result<Option<Event>, EventStoreError> {
        let state = self.read()?;
        Ok(state
            .idempotency
            .get(&(*project_id, key.to_string()))
            .and_then(|id| state.events.get(id))
            .map(|e| e.event.clone()))
    }

    async fn get_api_key_by_hash(&self, key_hash: &str) -> Result<ApiKey, EventStoreError> {
        self.read()?
            .api_keys
            .get(key_hash)
            .cloned()
            .ok_or(EventStoreError::NotFound)
    }

    async fn mark_queued(&self, id: &EventId) -> Result<(), EventStoreError> {
        let mut state = self.write()?;
        let stored = state.events.get_mut(id).ok_or(EventStoreError::NotFound)?;
        stored.queued = true;
        Ok(())
    }

    async fn list_unqueued(
        &self,
        received_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, EventStoreError> {
        let state = self.read()?;
        let mut pending: Vec<Event> = state
            .events
            .values()
            .filter(|e| !e.queued && e.event.received_at < received_before)
            .map(|e| e.event.clone())
            .collect();
        pending.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pulse_events::Metadata;

    fn event(project_id: ProjectId, key: Option<&str>) -> Event {
        let now = Utc::now();
        Event {
            id: EventId::new(),
            project_id,
            event_name: "user_signup".into(),
            user_id: None,
            timestamp: now,
            metadata: Metadata::new(),
            received_at: now,
            ip_address: None,
            user_agent: None,
            idempotency_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn insert_then_get_by_id() {
        let store = InMemoryEventStore::new();
        let e = event(ProjectId::new(), None);
        store.insert(&e).await.unwrap();

        assert_eq!(store.get_by_id(&e.id).await.unwrap(), e);
        assert!(matches!(
            store.get_by_id(&EventId::new()).await,
            Err(EventStoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = InMemoryEventStore::new();
        let e = event(ProjectId::new(), None);
        store.insert(&e).await.unwrap();

        assert!(matches!(
            store.insert(&e).await,
            Err(EventStoreError::DuplicateId(id)) if id == e.id
        ));
    }

    #[tokio::test]
    async fn idempotency_keys_are_unique_per_project() {
        let store = InMemoryEventStore::new();
        let project = ProjectId::new();
        let first = event(project, Some("order42"));
        store.insert(&first).await.unwrap();

        match store.insert(&event(project, Some("order42"))).await {
            Err(EventStoreError::DuplicateIdempotencyKey { existing }) => {
                assert_eq!(existing.id, first.id)
            }
            other => panic!("expected duplicate key, got {other:?}"),
        }

        // Same key in another project is independent.
        store.insert(&event(ProjectId::new(), Some("order42"))).await.unwrap();

        let found = store
            .get_by_idempotency_key(&project, "order42")
            .await
            .unwrap();
        assert_eq!(found.map(|e| e.id), Some(first.id));
    }

    #[tokio::test]
    async fn unqueued_events_are_listed_until_marked() {
        let store = InMemoryEventStore::new();
        let mut old = event(ProjectId::new(), None);
        old.received_at = Utc::now() - Duration::minutes(5);
        let fresh = event(ProjectId::new(), None);
        store.insert(&old).await.unwrap();
        store.insert(&fresh).await.unwrap();

        let cutoff = Utc::now() - Duration::minutes(1);
        let pending = store.list_unqueued(cutoff, 10).await.unwrap();
        assert_eq!(pending.iter().map(|e| e.id).collect::<Vec<_>>(), vec![old.id]);

        store.mark_queued(&old.id).await.unwrap();
        assert!(store.list_unqueued(cutoff, 10).await.unwrap().is_empty());
        assert!(store.is_queued(&old.id));
    }

    #[tokio::test]
    async fn api_keys_are_found_by_hash() {
        let store = InMemoryEventStore::new();
        let key = ApiKey::issue(ProjectId::new(), "dev", "dev_key");
        store.insert_api_key(key.clone()).unwrap();

        assert_eq!(store.get_api_key_by_hash(&key.key_hash).await.unwrap(), key);
        assert!(matches!(
            store.get_api_key_by_hash("nope").await,
            Err(EventStoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn injected_failures_leave_no_trace() {
        let store = InMemoryEventStore::new();
        store.fail_next_inserts(1);

        let e = event(ProjectId::new(), None);
        assert!(matches!(
            store.insert(&e).await,
            Err(EventStoreError::Connectivity(_))
        ));
        assert!(store.is_empty());
    }
}
