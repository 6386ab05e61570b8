use std::sync::Arc;

use pulse_auth::{ApiKeyAuthProvider, AuthProvider};
use pulse_infra::event_store::StoreKeyLookup;
use pulse_infra::{Backends, IngestionService};
use pulse_observability::Metrics;

/// Everything the HTTP layer needs, shared across requests.
#[derive(Clone)]
pub struct AppServices {
    pub ingestion: Arc<IngestionService>,
    pub auth: Arc<dyn AuthProvider>,
    pub metrics: Metrics,
}

impl AppServices {
    /// API keys are resolved against the same store events are written to.
    pub fn new(backends: &Backends, metrics: Metrics) -> Self {
        let ingestion =
            IngestionService::new(backends.store.clone(), backends.queue.clone(), metrics.clone());
        let auth = ApiKeyAuthProvider::new(Arc::new(StoreKeyLookup::new(backends.store.clone())));

        Self {
            ingestion: Arc::new(ingestion),
            auth: Arc::new(auth),
            metrics,
        }
    }
}
