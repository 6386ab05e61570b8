//! Infrastructure layer: storage and queue adapters, the ingestion and
//! processing pipeline, webhook dispatch and configuration.

pub mod backends;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod event_store;
pub mod ingestion;
pub mod pipeline;
pub mod processing;
pub mod queue;
pub mod reconciliation;
pub mod retry;
pub mod shutdown;

pub use backends::{BackendError, Backends, rule_store};
pub use config::{Config, ConfigError};
pub use consumer::{
    ConsumerError, ConsumerHandle, ConsumerLoop, ConsumerReport, Handler, HandlerError,
};
pub use dispatch::{ActionDispatcher, ActionResult};
pub use ingestion::{BatchItemResult, IngestError, IngestOutcome, IngestionService};
pub use pipeline::Pipeline;
pub use processing::{EventProcessor, ProcessingOutcome};
pub use reconciliation::{Reconciler, SweepReport};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use shutdown::shutdown_signal;
