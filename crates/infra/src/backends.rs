//! Store/queue/cursor wiring selected by [`Config`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use pulse_auth::ApiKey;
use pulse_core::ProjectId;
use pulse_events::{EventQueue, InMemoryEventQueue, QueueError};
use pulse_rules::{InMemoryRuleStore, RuleSet, RuleSetError};

use crate::config::Config;
use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore};
use crate::queue::{CursorStore, InMemoryCursorStore};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Rules(#[from] RuleSetError),

    #[error("persistent stores require the `redis` feature")]
    RedisDisabled,
}

/// Shared handles to the pipeline's storage collaborators.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn EventStore>,
    pub queue: Arc<dyn EventQueue>,
    pub cursors: Arc<dyn CursorStore>,
    /// `true` when everything lives in this process; consumers must then run
    /// in-process too.
    pub in_memory: bool,
}

impl Backends {
    pub fn in_memory(partitions: u32) -> Self {
        Self {
            store: Arc::new(InMemoryEventStore::new()),
            queue: Arc::new(InMemoryEventQueue::with_partitions(partitions)),
            cursors: Arc::new(InMemoryCursorStore::new()),
            in_memory: true,
        }
    }

    /// In-memory backends with `api_key` registered for a fresh project.
    pub fn in_memory_with_key(partitions: u32, api_key: &str) -> Result<(Self, ProjectId), BackendError> {
        let store = Arc::new(InMemoryEventStore::new());
        let project_id = ProjectId::new();
        store.insert_api_key(ApiKey::issue(project_id, "dev", api_key))?;

        let backends = Self {
            store,
            queue: Arc::new(InMemoryEventQueue::with_partitions(partitions)),
            cursors: Arc::new(InMemoryCursorStore::new()),
            in_memory: true,
        };
        Ok((backends, project_id))
    }

    pub async fn from_config(config: &Config) -> Result<Self, BackendError> {
        if !config.use_persistent_stores {
            return match &config.dev_api_key {
                Some(key) => {
                    let (backends, project_id) = Self::in_memory_with_key(config.partitions, key)?;
                    info!(%project_id, "in-memory stores seeded with dev API key");
                    Ok(backends)
                }
                None => {
                    warn!("in-memory stores without PULSE_DEV_API_KEY; every request will be rejected");
                    Ok(Self::in_memory(config.partitions))
                }
            };
        }
        Self::persistent(config).await
    }

    #[cfg(feature = "redis")]
    async fn persistent(config: &Config) -> Result<Self, BackendError> {
        use crate::event_store::PostgresEventStore;
        use crate::queue::{PostgresCursorStore, RedisStreamsEventQueue};

        let store = PostgresEventStore::connect(&config.database_url).await?;
        store.migrate().await?;
        let cursors = PostgresCursorStore::new(store.pool().clone());
        let queue = RedisStreamsEventQueue::new(
            &config.redis_url,
            Some(config.stream_prefix.clone()),
            config.partitions,
        )?;
        info!(partitions = config.partitions, "connected to Postgres and Redis");

        Ok(Self {
            store: Arc::new(store),
            queue: Arc::new(queue),
            cursors: Arc::new(cursors),
            in_memory: false,
        })
    }

    #[cfg(not(feature = "redis"))]
    async fn persistent(_config: &Config) -> Result<Self, BackendError> {
        Err(BackendError::RedisDisabled)
    }
}

/// Rule store from `PULSE_RULES_PATH`, or the built-in premium-signup rule.
pub fn rule_store(config: &Config) -> Result<InMemoryRuleStore, BackendError> {
    let store = match &config.rules_path {
        Some(path) => {
            info!(path = %path.display(), "loading rule set");
            InMemoryRuleStore::from_path(path)?
        }
        None => InMemoryRuleStore::new(RuleSet::premium_signup(&config.default_webhook_url))?,
    };
    Ok(store)
}
