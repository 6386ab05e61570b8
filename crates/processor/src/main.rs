//! Standalone processing worker: consumes every queue partition, evaluates
//! rules and dispatches webhooks until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;

use pulse_infra::{Backends, Config, Pipeline, pipeline, rule_store, shutdown_signal};
use pulse_observability::{Metrics, TracingMetrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pulse_observability::init();

    let config = Config::from_env().context("invalid configuration")?;
    let metrics: Metrics = Arc::new(TracingMetrics);
    let backends = Backends::from_config(&config)
        .await
        .context("failed to initialise stores")?;

    if backends.in_memory {
        bail!("pulse-processor needs USE_PERSISTENT_STORES=true; in-memory mode processes inside pulse-api");
    }

    let rules = Arc::new(rule_store(&config).context("failed to load rules")?);
    let processor = pipeline::processor(&config, rules, None, metrics);
    let running = Pipeline::start(&config, &backends, processor, CancellationToken::new());

    shutdown_signal().await;
    tracing::info!("shutdown requested, draining consumers");

    let report = running.shutdown().await;
    tracing::info!(
        handled = report.handled,
        dead_lettered = report.dead_lettered,
        "processor stopped"
    );
    Ok(())
}
