//! Per-event processing: normalize, evaluate rules, dispatch actions.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use pulse_events::{Event, Normalizer};
use pulse_observability::Metrics;
use pulse_rules::{RuleEngine, RuleStore};

use crate::consumer::{Handler, HandlerError};
use crate::dispatch::{ActionDispatcher, ActionResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    NoMatch,
    Dispatched {
        /// Ids of the rules that matched, in evaluation order.
        matched: Vec<String>,
        results: Vec<ActionResult>,
    },
}

#[derive(Clone)]
pub struct EventProcessor {
    normalizer: Normalizer,
    rules: Arc<dyn RuleStore>,
    engine: RuleEngine,
    dispatcher: ActionDispatcher,
    metrics: Metrics,
}

impl EventProcessor {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        engine: RuleEngine,
        dispatcher: ActionDispatcher,
        metrics: Metrics,
    ) -> Self {
        Self {
            normalizer: Normalizer::new(),
            rules,
            engine,
            dispatcher,
            metrics,
        }
    }

    /// Normalize and rule-store failures are errors (the consumer retries them);
    /// dispatch failures are reported in the outcome only. If `token` stops
    /// dispatch part-way the result is [`HandlerError::Cancelled`], so the event
    /// is processed again after restart.
    #[instrument(skip(self, event, token), fields(event_id = %event.id, project_id = %event.project_id), err)]
    pub async fn process(
        &self,
        event: Event,
        token: &CancellationToken,
    ) -> Result<ProcessingOutcome, HandlerError> {
        let event = self.normalizer.normalize(event)?;
        let rules = self.rules.rules_for(&event.project_id).await?;
        let matched = self.engine.evaluate(&event, &rules);

        if matched.is_empty() {
            debug!(event_name = %event.event_name, "no rule matched");
            self.metrics.event_processed(&event.event_name, "no_match");
            return Ok(ProcessingOutcome::NoMatch);
        }

        let results = self.dispatcher.execute(&event, &matched, token).await;
        if results.iter().any(ActionResult::is_cancelled) {
            return Err(HandlerError::Cancelled);
        }
        let matched: Vec<String> = matched.iter().map(|r| r.id.clone()).collect();
        info!(
            event_name = %event.event_name,
            rules = ?matched,
            actions = results.len(),
            "event dispatched"
        );
        self.metrics.event_processed(&event.event_name, "dispatched");
        Ok(ProcessingOutcome::Dispatched { matched, results })
    }
}

#[async_trait]
impl Handler for EventProcessor {
    async fn handle(&self, event: &Event, token: &CancellationToken) -> Result<(), HandlerError> {
        self.process(event.clone(), token).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use pulse_core::{EventId, ProjectId};
    use pulse_events::{FormatError, Metadata, MetadataValue};
    use pulse_observability::NoopMetrics;
    use pulse_rules::{Action, InMemoryRuleStore, MatchMode, Rule, RuleSet, RuleStoreError};

    use super::*;
    use crate::dispatch::{CircuitBreaker, RecordingWebhookClient};
    use crate::retry::RetryPolicy;

    const URL: &str = "https://hooks.example.com/premium";

    fn event(name: &str, plan: Option<&str>) -> Event {
        let now = Utc::now();
        let mut metadata = Metadata::new();
        if let Some(plan) = plan {
            metadata.insert("plan".into(), MetadataValue::from(plan));
        }
        Event {
            id: EventId::new(),
            project_id: ProjectId::new(),
            event_name: name.into(),
            user_id: None,
            timestamp: now,
            metadata,
            received_at: now,
            ip_address: None,
            user_agent: None,
            idempotency_key: None,
        }
    }

    fn processor(
        rules: Arc<dyn RuleStore>,
        client: Arc<RecordingWebhookClient>,
        mode: MatchMode,
    ) -> EventProcessor {
        let metrics: Metrics = Arc::new(NoopMetrics);
        let dispatcher = ActionDispatcher::new(
            client,
            RetryPolicy::fixed(2, Duration::from_millis(1)),
            CircuitBreaker::default(),
            metrics.clone(),
        );
        EventProcessor::new(rules, RuleEngine::new(mode), dispatcher, metrics)
    }

    fn premium_rules() -> Arc<dyn RuleStore> {
        Arc::new(InMemoryRuleStore::new(RuleSet::premium_signup(URL)).unwrap())
    }

    #[tokio::test]
    async fn premium_signup_triggers_webhook() {
        let client = Arc::new(RecordingWebhookClient::new());
        let p = processor(premium_rules(), client.clone(), MatchMode::FireAll);

        let outcome = p.process(event(" User_Signup ", Some("premium")), &CancellationToken::new()).await.unwrap();

        match outcome {
            ProcessingOutcome::Dispatched { matched, results } => {
                assert_eq!(matched, vec!["premium-signup".to_string()]);
                assert!(matches!(results[0], ActionResult::Delivered { .. }));
            }
            other => panic!("expected dispatch, got {other:?}"),
        }
        let sent = client.deliveries();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, URL);
        assert_eq!(sent[0].payload.event.event_name, "user_signup");
    }

    #[tokio::test]
    async fn basic_or_missing_plan_does_not_match() {
        let client = Arc::new(RecordingWebhookClient::new());
        let p = processor(premium_rules(), client.clone(), MatchMode::FireAll);

        for plan in [Some("basic"), None] {
            let outcome = p.process(event("user_signup", plan), &CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, ProcessingOutcome::NoMatch);
        }
        assert!(client.deliveries().is_empty());
    }

    #[tokio::test]
    async fn first_match_mode_fires_one_rule() {
        let client = Arc::new(RecordingWebhookClient::new());
        let rules: Arc<dyn RuleStore> = Arc::new(
            InMemoryRuleStore::new(RuleSet::new(vec![
                Rule::new("a", "user_signup").then(Action::webhook("https://a.example.com")),
                Rule::new("b", "user_signup").then(Action::webhook("https://b.example.com")),
            ]))
            .unwrap(),
        );

        let all = processor(rules.clone(), client.clone(), MatchMode::FireAll);
        let first = processor(rules, client.clone(), MatchMode::FirstMatch);

        assert!(matches!(
            all.process(event("user_signup", None), &CancellationToken::new()).await.unwrap(),
            ProcessingOutcome::Dispatched { ref matched, .. } if matched.len() == 2
        ));
        assert!(matches!(
            first.process(event("user_signup", None), &CancellationToken::new()).await.unwrap(),
            ProcessingOutcome::Dispatched { ref matched, .. } if matched == &vec!["a".to_string()]
        ));
    }

    #[tokio::test]
    async fn corrupted_name_is_a_handler_error() {
        let client = Arc::new(RecordingWebhookClient::new());
        let p = processor(premium_rules(), client, MatchMode::FireAll);

        let err = p.handle(&event("9lives", None), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Format(FormatError::InvalidEventName(_))));
    }

    #[tokio::test]
    async fn rule_store_failure_is_a_handler_error() {
        struct Down;

        #[async_trait]
        impl RuleStore for Down {
            async fn rules_for(&self, _: &ProjectId) -> Result<Vec<Rule>, RuleStoreError> {
                Err(RuleStoreError::Unavailable("offline".into()))
            }
        }

        let p = processor(
            Arc::new(Down),
            Arc::new(RecordingWebhookClient::new()),
            MatchMode::FireAll,
        );
        let err = p.handle(&event("user_signup", None), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Rules(RuleStoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn webhook_failure_does_not_fail_the_handler() {
        let client = Arc::new(RecordingWebhookClient::new());
        client.fail_with(vec![crate::dispatch::WebhookError::Status(500); 2]);
        let p = processor(premium_rules(), client.clone(), MatchMode::FireAll);

        assert!(p.handle(&event("user_signup", Some("premium")), &CancellationToken::new()).await.is_ok());
        assert_eq!(client.deliveries().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_during_dispatch_is_reported_as_cancelled() {
        let client = Arc::new(RecordingWebhookClient::new());
        let p = processor(premium_rules(), client.clone(), MatchMode::FireAll);
        let token = CancellationToken::new();
        token.cancel();

        let err = p
            .process(event("user_signup", Some("premium")), &token)
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Cancelled));
        assert!(client.deliveries().is_empty());

        // Events with nothing to dispatch are unaffected.
        let outcome = p.process(event("user_signup", Some("basic")), &token).await.unwrap();
        assert_eq!(outcome, ProcessingOutcome::NoMatch);
    }
}
