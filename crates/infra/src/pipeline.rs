//! Processing-side wiring: one consumer per partition plus the reconciler.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pulse_observability::Metrics;
use pulse_rules::{RuleEngine, RuleStore};

use crate::backends::Backends;
use crate::config::Config;
use crate::consumer::{ConsumerHandle, ConsumerLoop, ConsumerReport};
use crate::dispatch::{
    ActionDispatcher, CircuitBreaker, CircuitBreakerConfig, HttpWebhookClient, WebhookClient,
};
use crate::processing::EventProcessor;
use crate::reconciliation::Reconciler;

/// Build the event processor described by `config`.
pub fn processor(
    config: &Config,
    rules: Arc<dyn RuleStore>,
    client: Option<Arc<dyn WebhookClient>>,
    metrics: Metrics,
) -> EventProcessor {
    let client: Arc<dyn WebhookClient> = match client {
        Some(client) => client,
        None => Arc::new(HttpWebhookClient::new(config.webhook_timeout)),
    };
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: config.breaker_failures,
        success_threshold: 1,
        reset_timeout: config.breaker_reset,
    });
    let dispatcher = ActionDispatcher::new(client, config.webhook_retry(), breaker, metrics.clone());
    EventProcessor::new(rules, RuleEngine::default(), dispatcher, metrics)
}

/// Running consumers and reconciler, stopped together.
pub struct Pipeline {
    token: CancellationToken,
    consumers: Vec<ConsumerHandle>,
    reconciler: JoinHandle<()>,
}

impl Pipeline {
    /// Spawn a consumer for every partition of `backends.queue` and the
    /// reconciliation sweep. All of them stop when `token` is cancelled.
    pub fn start(
        config: &Config,
        backends: &Backends,
        processor: EventProcessor,
        token: CancellationToken,
    ) -> Self {
        let handler = Arc::new(processor);
        let consumers = (0..backends.queue.partitions())
            .map(|partition| {
                ConsumerLoop::new(
                    partition,
                    backends.queue.clone(),
                    backends.cursors.clone(),
                    token.child_token(),
                )
                .with_retry(config.handler_retry())
                .with_batch_size(config.consumer_batch)
                .with_block(config.consumer_block)
                .spawn(handler.clone())
            })
            .collect::<Vec<_>>();

        let reconciler = Reconciler::new(
            backends.store.clone(),
            backends.queue.clone(),
            config.reconcile_grace,
            config.reconcile_interval,
        );
        let reconciler = tokio::spawn({
            let token = token.child_token();
            async move { reconciler.run(token).await }
        });

        info!(consumers = consumers.len(), "processing pipeline started");
        Self {
            token,
            consumers,
            reconciler,
        }
    }

    /// Cancel everything and wait for each task to finish.
    pub async fn shutdown(self) -> ConsumerReport {
        self.token.cancel();

        let mut total = ConsumerReport::default();
        for consumer in self.consumers {
            let partition = consumer.partition();
            match consumer.join().await {
                Ok(report) => {
                    total.handled += report.handled;
                    total.dead_lettered += report.dead_lettered;
                    total.abandoned += report.abandoned;
                }
                Err(err) => error!(partition, error = %err, "consumer exited with error"),
            }
        }
        if let Err(err) = self.reconciler.await {
            error!(error = %err, "reconciler task failed");
        }

        info!(
            handled = total.handled,
            dead_lettered = total.dead_lettered,
            abandoned = total.abandoned,
            "processing pipeline stopped"
        );
        total
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulse_core::ProjectId;
    use pulse_events::EventRequest;
    use pulse_observability::NoopMetrics;
    use pulse_rules::{InMemoryRuleStore, RuleSet};

    use super::*;
    use crate::dispatch::RecordingWebhookClient;
    use crate::ingestion::IngestionService;

    #[tokio::test]
    async fn ingested_premium_signup_reaches_the_webhook() {
        let config = Config {
            partitions: 2,
            consumer_block: Duration::from_millis(20),
            default_webhook_url: "https://hooks.example.com/premium".into(),
            ..Config::default()
        };
        let backends = Backends::in_memory(config.partitions);
        let metrics: Metrics = Arc::new(NoopMetrics);
        let client = Arc::new(RecordingWebhookClient::new());
        let rules = Arc::new(
            InMemoryRuleStore::new(RuleSet::premium_signup(&config.default_webhook_url)).unwrap(),
        );

        let webhook: Arc<dyn WebhookClient> = client.clone();

        let pipeline = Pipeline::start(
            &config,
            &backends,
            processor(&config, rules, Some(webhook), metrics.clone()),
            CancellationToken::new(),
        );

        let ingestion =
            IngestionService::new(backends.store.clone(), backends.queue.clone(), metrics);
        ingestion
            .ingest(
                EventRequest::new("User_Signup").with_metadata("plan", "premium"),
                ProjectId::new(),
                None,
                None,
            )
            .await
            .unwrap();

        for _ in 0..200 {
            if !client.deliveries().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let report = pipeline.shutdown().await;

        let sent = client.deliveries();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "https://hooks.example.com/premium");
        assert_eq!(sent[0].payload.event.event_name, "user_signup");
        assert_eq!(report.handled, 1);
    }
}
