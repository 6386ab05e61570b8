//! Versioned rule-set document.
//!
//! ```json
//! {
//!   "version": 1,
//!   "rules": [ { "id": "...", "event_name": "...", "conditions": {...}, "actions": [...] } ],
//!   "projects": { "<project uuid>": [ ...rules for that project only... ] }
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pulse_core::ProjectId;
use pulse_events::{is_normalized_name, normalize_name};

use crate::rule::{Action, Rule};

pub const CURRENT_VERSION: u32 = 1;

pub const DEFAULT_PREMIUM_WEBHOOK_URL: &str = "https://api.example.com/webhooks/premium-signup";

#[derive(Debug, Error)]
pub enum RuleSetError {
    #[error("failed to read rule set: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse rule set: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported rule set version {0} (expected {CURRENT_VERSION})")]
    UnsupportedVersion(u32),

    #[error("duplicate rule id: {0}")]
    DuplicateRuleId(String),

    #[error("rule {0} has an empty event_name")]
    EmptyEventName(String),

    #[error("rule {rule_id} has an invalid event_name: {event_name:?}")]
    InvalidEventName { rule_id: String, event_name: String },

    #[error("rule {rule_id} has an invalid webhook url: {url}")]
    InvalidWebhookUrl { rule_id: String, url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: u32,
    /// Rules applied to every project.
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Rules applied to one project, after the global ones.
    #[serde(default)]
    pub projects: BTreeMap<ProjectId, Vec<Rule>>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            version: CURRENT_VERSION,
            rules,
            projects: BTreeMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// The built-in rule set: premium sign-ups trigger a webhook to `webhook_url`.
    pub fn premium_signup(webhook_url: impl Into<String>) -> Self {
        Self::new(vec![
            Rule::new("premium-signup", "user_signup")
                .when("metadata.plan", "premium")
                .then(Action::webhook(webhook_url)),
        ])
    }

    pub fn with_project_rules(mut self, project_id: ProjectId, rules: Vec<Rule>) -> Self {
        self.projects.entry(project_id).or_default().extend(rules);
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, RuleSetError> {
        let set: RuleSet = serde_json::from_str(raw)?;
        set.normalized()
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RuleSetError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Bring every rule's `event_name` into the form events are matched in
    /// (trimmed, lowercase), then [`validate`](Self::validate).
    pub fn normalized(mut self) -> Result<Self, RuleSetError> {
        for rule in self.rules.iter_mut().chain(self.projects.values_mut().flatten()) {
            rule.event_name = normalize_name(&rule.event_name);
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject documents the engine cannot evaluate faithfully.
    ///
    /// Rule event names must already be normalized, otherwise they could never
    /// match a processed event.
    pub fn validate(&self) -> Result<(), RuleSetError> {
        if self.version != CURRENT_VERSION {
            return Err(RuleSetError::UnsupportedVersion(self.version));
        }

        let mut seen = HashSet::new();
        for rule in self.rules.iter().chain(self.projects.values().flatten()) {
            if !seen.insert(rule.id.as_str()) {
                return Err(RuleSetError::DuplicateRuleId(rule.id.clone()));
            }
            if rule.event_name.trim().is_empty() {
                return Err(RuleSetError::EmptyEventName(rule.id.clone()));
            }
            if !is_normalized_name(&rule.event_name) {
                return Err(RuleSetError::InvalidEventName {
                    rule_id: rule.id.clone(),
                    event_name: rule.event_name.clone(),
                });
            }
            for action in &rule.actions {
                match action {
                    Action::Webhook { url }
                        if !(url.starts_with("http://") || url.starts_with("https://")) =>
                    {
                        return Err(RuleSetError::InvalidWebhookUrl {
                            rule_id: rule.id.clone(),
                            url: url.clone(),
                        });
                    }
                    Action::Webhook { .. } => {}
                }
            }
        }
        Ok(())
    }

    /// Global rules followed by the project's own rules.
    pub fn rules_for(&self, project_id: &ProjectId) -> Vec<Rule> {
        let mut rules = self.rules.clone();
        if let Some(scoped) = self.projects.get(project_id) {
            rules.extend(scoped.iter().cloned());
        }
        rules
    }
}
