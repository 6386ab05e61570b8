//! Where rules come from.

use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use pulse_core::ProjectId;

use crate::rule::Rule;
use crate::rule_set::{RuleSet, RuleSetError};

#[derive(Debug, Error)]
pub enum RuleStoreError {
    #[error("rule store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    RuleSet(#[from] RuleSetError),
}

/// Source of the rules evaluated for a project.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn rules_for(&self, project_id: &ProjectId) -> Result<Vec<Rule>, RuleStoreError>;
}

#[async_trait]
impl<S> RuleStore for Arc<S>
where
    S: RuleStore + ?Sized,
{
    async fn rules_for(&self, project_id: &ProjectId) -> Result<Vec<Rule>, RuleStoreError> {
        (**self).rules_for(project_id).await
    }
}

/// Rule store holding one [`RuleSet`] in memory.
///
/// The set can be swapped at runtime with [`replace`](Self::replace) or
/// [`reload_from_path`](Self::reload_from_path); readers see either the old or
/// the new set, never a mix.
#[derive(Debug)]
pub struct InMemoryRuleStore {
    inner: RwLock<Arc<RuleSet>>,
}

impl InMemoryRuleStore {
    pub fn new(set: RuleSet) -> Result<Self, RuleSetError> {
        let set = set.normalized()?;
        Ok(Self {
            inner: RwLock::new(Arc::new(set)),
        })
    }

    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(Arc::new(RuleSet::empty())),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RuleSetError> {
        Self::new(RuleSet::from_path(path)?)
    }

    pub fn replace(&self, set: RuleSet) -> Result<(), RuleStoreError> {
        let set = set.normalized()?;
        let mut guard = self
            .inner
            .write()
            .map_err(|_| RuleStoreError::Unavailable("rule set lock poisoned".into()))?;
        *guard = Arc::new(set);
        Ok(())
    }

    pub fn reload_from_path(&self, path: impl AsRef<Path>) -> Result<(), RuleStoreError> {
        let set = RuleSet::from_path(path)?;
        self.replace(set)?;
        tracing::info!("rule set reloaded");
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Arc<RuleSet>, RuleStoreError> {
        self.inner
            .read()
            .map(|set| Arc::clone(&*set))
            .map_err(|_| RuleStoreError::Unavailable("rule set lock poisoned".into()))
    }
}

impl Default for InMemoryRuleStore {
    fn default() -> Self {
        Self::empty()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn rules_for(&self, project_id: &ProjectId) -> Result<Vec<Rule>, RuleStoreError> {
        Ok(self.snapshot()?.rules_for(project_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_set::DEFAULT_PREMIUM_WEBHOOK_URL;

    #[tokio::test]
    async fn serves_global_and_project_rules() {
        let project = ProjectId::new();
        let store = InMemoryRuleStore::new(
            RuleSet::premium_signup(DEFAULT_PREMIUM_WEBHOOK_URL)
                .with_project_rules(project, vec![Rule::new("checkout", "purchase")]),
        )
        .unwrap();

        assert_eq!(store.rules_for(&project).await.unwrap().len(), 2);
        assert_eq!(store.rules_for(&ProjectId::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replace_swaps_rules_without_restart() {
        let store = InMemoryRuleStore::empty();
        let project = ProjectId::new();
        assert!(store.rules_for(&project).await.unwrap().is_empty());

        store
            .replace(RuleSet::premium_signup(DEFAULT_PREMIUM_WEBHOOK_URL))
            .unwrap();
        assert_eq!(store.rules_for(&project).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mixed_case_rule_matches_normalized_events() {
        use chrono::Utc;
        use pulse_core::EventId;
        use pulse_events::{Event, Metadata};

        use crate::engine::RuleEngine;

        let store = InMemoryRuleStore::new(RuleSet::new(vec![Rule::new("signup", "User_Signup")])).unwrap();
        let project = ProjectId::new();
        let now = Utc::now();
        let event = Event {
            id: EventId::new(),
            project_id: project,
            event_name: "user_signup".into(),
            user_id: None,
            timestamp: now,
            metadata: Metadata::new(),
            received_at: now,
            ip_address: None,
            user_agent: None,
            idempotency_key: None,
        };

        let rules = store.rules_for(&project).await.unwrap();
        assert_eq!(RuleEngine::default().evaluate(&event, &rules).len(), 1);
    }

    #[tokio::test]
    async fn invalid_replacement_keeps_previous_rules() {
        let store = InMemoryRuleStore::new(RuleSet::premium_signup(DEFAULT_PREMIUM_WEBHOOK_URL)).unwrap();
        let mut bad = RuleSet::empty();
        bad.version = 9;

        assert!(store.replace(bad).is_err());
        assert_eq!(store.rules_for(&ProjectId::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn loads_rules_from_file() {
        let path = std::env::temp_dir().join(format!("pulse-rules-{}.json", ProjectId::new()));
        std::fs::write(
            &path,
            r#"{"version":1,"rules":[{"id":"a","event_name":"ping","actions":[]}]}"#,
        )
        .unwrap();

        let store = InMemoryRuleStore::from_path(&path).unwrap();
        let rules = store.rules_for(&ProjectId::new()).await.unwrap();
        assert_eq!(rules[0].id, "a");

        std::fs::remove_file(&path).ok();
    }
}
