use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use pulse_api::app::{AppServices, build_app};
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

    // In-memory stores only exist in this process, so processing runs here too.
    let token = CancellationToken::new();
    let processing = if backends.in_memory {
        let rules = Arc::new(rule_store(&config)?);
        let processor = pipeline::processor(&config, rules, None, metrics.clone());
        Some(Pipeline::start(&config, &backends, processor, token.clone()))
    } else {
        None
    };

    let app = build_app(AppServices::new(&backends, metrics));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(processing) = processing {
        processing.shutdown().await;
    }
    Ok(())
}
