//! Declarative rules: model, versioned rule-set documents, matching and the
//! `RuleStore` contract the processor reads from.

pub mod engine;
pub mod rule;
pub mod rule_set;
pub mod store;

pub use engine::{MatchMode, RuleEngine};
pub use rule::{Action, FieldPath, Rule};
pub use rule_set::{CURRENT_VERSION, DEFAULT_PREMIUM_WEBHOOK_URL, RuleSet, RuleSetError};
pub use store::{InMemoryRuleStore, RuleStore, RuleStoreError};
