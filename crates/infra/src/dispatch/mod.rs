//! Action execution for matched rules.
//!
//! Each action is retried with backoff up to the policy's attempt ceiling and
//! then dropped with an error log. Dispatch never reports failure to its caller:
//! the owning event's stored/queued state is never affected by a webhook.
//!
//! The caller's cancellation token cuts both the in-flight request and the
//! backoff between attempts short; the action is then reported as cancelled.

pub mod circuit_breaker;
pub mod webhook;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pulse_events::Event;
use pulse_observability::Metrics;
use pulse_rules::{Action, Rule};

use crate::retry::{RetryPolicy, sleep_or_cancel};

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use webhook::{
    HttpWebhookClient, RecordedDelivery, RecordingWebhookClient, WebhookClient, WebhookError,
    WebhookPayload,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Delivered {
        rule_id: String,
        url: String,
        attempts: u32,
        status: u16,
    },
    Failed {
        rule_id: String,
        url: String,
        attempts: u32,
        error: String,
    },
    /// The destination's circuit was open; nothing was sent.
    Suppressed { rule_id: String, url: String },
    /// Shutdown interrupted the action after `attempts` completed tries.
    Cancelled {
        rule_id: String,
        url: String,
        attempts: u32,
    },
}

impl ActionResult {
    pub fn outcome(&self) -> &'static str {
        match self {
            ActionResult::Delivered { .. } => "delivered",
            ActionResult::Failed { .. } => "failed",
            ActionResult::Suppressed { .. } => "suppressed",
            ActionResult::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ActionResult::Cancelled { .. })
    }
}

#[derive(Clone)]
pub struct ActionDispatcher {
    client: Arc<dyn WebhookClient>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    metrics: Metrics,
}

impl ActionDispatcher {
    pub fn new(
        client: Arc<dyn WebhookClient>,
        retry: RetryPolicy,
        breaker: CircuitBreaker,
        metrics: Metrics,
    ) -> Self {
        Self {
            client,
            retry,
            breaker,
            metrics,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run every action of every matched rule, in rule order then action order.
    /// Once `token` is cancelled the remaining actions are reported as
    /// cancelled without being attempted.
    pub async fn execute(
        &self,
        event: &Event,
        matched: &[&Rule],
        token: &CancellationToken,
    ) -> Vec<ActionResult> {
        let mut results = Vec::new();
        for rule in matched {
            for action in &rule.actions {
                results.push(self.execute_action(event, &rule.id, action, token).await);
            }
        }
        results
    }

    pub async fn execute_action(
        &self,
        event: &Event,
        rule_id: &str,
        action: &Action,
        token: &CancellationToken,
    ) -> ActionResult {
        let result = match action {
            Action::Webhook { url } => self.deliver_webhook(event, rule_id, url, token).await,
        };
        self.metrics.action_dispatched("webhook", result.outcome());
        result
    }

    async fn deliver_webhook(
        &self,
        event: &Event,
        rule_id: &str,
        url: &str,
        token: &CancellationToken,
    ) -> ActionResult {
        let cancelled = |attempts: u32| {
            info!(event_id = %event.id, rule_id, url, attempts, "webhook cancelled by shutdown");
            ActionResult::Cancelled {
                rule_id: rule_id.to_string(),
                url: url.to_string(),
                attempts,
            }
        };

        if token.is_cancelled() {
            return cancelled(0);
        }
        if !self.breaker.allow(url) {
            warn!(event_id = %event.id, rule_id, url, "circuit open; webhook suppressed");
            return ActionResult::Suppressed {
                rule_id: rule_id.to_string(),
                url: url.to_string(),
            };
        }

        let payload = WebhookPayload {
            rule_id: rule_id.to_string(),
            event: event.clone(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let sent = tokio::select! {
                biased;
                _ = token.cancelled() => return cancelled(attempt - 1),
                sent = self.client.send(url, &payload) => sent,
            };
            match sent {
                Ok(status) => {
                    self.breaker.record_success(url);
                    debug!(event_id = %event.id, rule_id, url, attempt, status, "webhook delivered");
                    return ActionResult::Delivered {
                        rule_id: rule_id.to_string(),
                        url: url.to_string(),
                        attempts: attempt,
                        status,
                    };
                }
                Err(err) => {
                    self.breaker.record_failure(url);
                    warn!(event_id = %event.id, rule_id, url, attempt, error = %err, "webhook attempt failed");

                    if self.retry.should_retry(attempt) && self.breaker.allow(url) {
                        if !sleep_or_cancel(self.retry.delay_after(attempt), token).await {
                            return cancelled(attempt);
                        }
                        continue;
                    }

                    error!(event_id = %event.id, rule_id, url, attempts = attempt, error = %err, "webhook dropped");
                    return ActionResult::Failed {
                        rule_id: rule_id.to_string(),
                        url: url.to_string(),
                        attempts: attempt,
                        error: err.to_string(),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use pulse_core::{EventId, ProjectId};
    use pulse_events::Metadata;
    use pulse_observability::InMemoryMetrics;

    use super::*;

    const URL: &str = "https://hooks.example.com/signup";

    fn event() -> Event {
        let now = Utc::now();
        Event {
            id: EventId::new(),
            project_id: ProjectId::new(),
            event_name: "user_signup".into(),
            user_id: None,
            timestamp: now,
            metadata: Metadata::new(),
            received_at: now,
            ip_address: None,
            user_agent: None,
            idempotency_key: None,
        }
    }

    fn dispatcher(
        client: Arc<RecordingWebhookClient>,
        metrics: Arc<InMemoryMetrics>,
    ) -> ActionDispatcher {
        ActionDispatcher::new(
            client,
            RetryPolicy::fixed(3, Duration::from_millis(1)),
            CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 1,
                reset_timeout: Duration::from_secs(60),
            }),
            metrics,
        )
    }

    fn rule() -> Rule {
        Rule::new("premium-signup", "user_signup").then(Action::webhook(URL))
    }

    #[tokio::test]
    async fn delivers_payload_with_rule_id_and_event() {
        let client = Arc::new(RecordingWebhookClient::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let d = dispatcher(client.clone(), metrics.clone());
        let e = event();
        let r = rule();

        let results = d.execute(&e, &[&r], &CancellationToken::new()).await;

        assert_eq!(
            results,
            vec![ActionResult::Delivered {
                rule_id: "premium-signup".into(),
                url: URL.into(),
                attempts: 1,
                status: 200,
            }]
        );
        let sent = client.deliveries();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.rule_id, "premium-signup");
        assert_eq!(sent[0].payload.event, e);
        assert_eq!(metrics.snapshot().action_count("webhook", "delivered"), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let client = Arc::new(RecordingWebhookClient::new());
        client.fail_with([WebhookError::Status(503)]);
        let d = dispatcher(client.clone(), Arc::new(InMemoryMetrics::new()));
        let r = rule();

        let results = d.execute(&event(), &[&r], &CancellationToken::new()).await;

        assert!(matches!(results[0], ActionResult::Delivered { attempts: 2, .. }));
        assert_eq!(client.deliveries().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_drop_and_open_the_circuit() {
        let client = Arc::new(RecordingWebhookClient::new());
        client.fail_with(vec![WebhookError::Timeout; 3]);
        let metrics = Arc::new(InMemoryMetrics::new());
        let d = dispatcher(client.clone(), metrics.clone());
        let r = rule();

        let first = d.execute(&event(), &[&r], &CancellationToken::new()).await;
        assert!(matches!(first[0], ActionResult::Failed { attempts: 3, .. }));
        assert_eq!(d.breaker().state(URL), CircuitState::Open);

        let second = d.execute(&event(), &[&r], &CancellationToken::new()).await;
        assert!(matches!(second[0], ActionResult::Suppressed { .. }));
        assert_eq!(client.deliveries().len(), 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.action_count("webhook", "failed"), 1);
        assert_eq!(snapshot.action_count("webhook", "suppressed"), 1);
    }

    #[tokio::test]
    async fn every_action_of_every_rule_runs_in_order() {
        let client = Arc::new(RecordingWebhookClient::new());
        let d = dispatcher(client.clone(), Arc::new(InMemoryMetrics::new()));
        let a = Rule::new("a", "user_signup")
            .then(Action::webhook("https://one.example.com"))
            .then(Action::webhook("https://two.example.com"));
        let b = Rule::new("b", "user_signup").then(Action::webhook("https://three.example.com"));

        let results = d.execute(&event(), &[&a, &b], &CancellationToken::new()).await;

        assert_eq!(results.len(), 3);
        let urls: Vec<String> = client.deliveries().into_iter().map(|d| d.url).collect();
        assert_eq!(
            urls,
            vec![
                "https://one.example.com",
                "https://two.example.com",
                "https://three.example.com"
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_cuts_webhook_backoff_short() {
        let client = Arc::new(RecordingWebhookClient::new());
        client.fail_with([WebhookError::Status(503)]);
        let metrics = Arc::new(InMemoryMetrics::new());
        let d = ActionDispatcher::new(
            client.clone(),
            RetryPolicy::fixed(3, Duration::from_secs(60)),
            CircuitBreaker::default(),
            metrics.clone(),
        );
        let a = Rule::new("a", "user_signup").then(Action::webhook(URL));
        let b = Rule::new("b", "user_signup").then(Action::webhook("https://two.example.com"));
        let token = CancellationToken::new();

        let canceller = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            }
        });
        let results = tokio::time::timeout(
            Duration::from_secs(1),
            d.execute(&event(), &[&a, &b], &token),
        )
        .await
        .expect("backoff should stop on cancellation");
        canceller.await.unwrap();

        assert_eq!(
            results,
            vec![
                ActionResult::Cancelled {
                    rule_id: "a".into(),
                    url: URL.into(),
                    attempts: 1,
                },
                ActionResult::Cancelled {
                    rule_id: "b".into(),
                    url: "https://two.example.com".into(),
                    attempts: 0,
                },
            ]
        );
        assert_eq!(client.deliveries().len(), 1);
        assert_eq!(metrics.snapshot().action_count("webhook", "cancelled"), 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_an_in_flight_request() {
        struct Hanging;

        #[async_trait::async_trait]
        impl WebhookClient for Hanging {
            async fn send(&self, _url: &str, _payload: &WebhookPayload) -> Result<u16, WebhookError> {
                std::future::pending().await
            }
        }

        let d = ActionDispatcher::new(
            Arc::new(Hanging),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
            CircuitBreaker::default(),
            Arc::new(InMemoryMetrics::new()),
        );
        let r = rule();
        let token = CancellationToken::new();
        token.cancel();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            d.deliver_webhook(&event(), &r.id, URL, &token),
        )
        .await
        .unwrap();
        assert!(result.is_cancelled());

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            d.execute_action(&event(), &r.id, &Action::webhook(URL), &token),
        )
        .await
        .expect("in-flight send should be abandoned");
        assert_eq!(
            result,
            ActionResult::Cancelled {
                rule_id: "premium-signup".into(),
                url: URL.into(),
                attempts: 0,
            }
        );
    }
}
