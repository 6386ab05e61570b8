//! Declarative rule model.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use pulse_events::{Event, MetadataValue};

/// A field of an [`Event`] addressable from a rule condition.
///
/// Paths are either a top-level field name or `metadata.<key>` (one level of
/// nesting). Anything else parses to [`FieldPath::Unknown`], which never resolves,
/// so a condition on it can never hold.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldPath {
    Id,
    EventName,
    UserId,
    ProjectId,
    Metadata(String),
    Unknown(String),
}

impl FieldPath {
    /// Value of this field on `event`, or `None` if it is absent.
    pub fn resolve(&self, event: &Event) -> Option<MetadataValue> {
        match self {
            FieldPath::Id => Some(MetadataValue::String(event.id.to_string())),
            FieldPath::EventName => Some(MetadataValue::String(event.event_name.clone())),
            FieldPath::UserId => event.user_id.clone().map(MetadataValue::String),
            FieldPath::ProjectId => Some(MetadataValue::String(event.project_id.to_string())),
            FieldPath::Metadata(key) => event.metadata.get(key).cloned(),
            FieldPath::Unknown(_) => None,
        }
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        match path.split_once('.') {
            None => match path {
                "id" => FieldPath::Id,
                "event_name" => FieldPath::EventName,
                "user_id" => FieldPath::UserId,
                "project_id" => FieldPath::ProjectId,
                other => FieldPath::Unknown(other.to_string()),
            },
            Some(("metadata", key)) if !key.is_empty() && !key.contains('.') => {
                FieldPath::Metadata(key.to_string())
            }
            Some(_) => FieldPath::Unknown(path.to_string()),
        }
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        FieldPath::from(path.as_str())
    }
}

impl FromStr for FieldPath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(FieldPath::from(s))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldPath::Id => f.write_str("id"),
            FieldPath::EventName => f.write_str("event_name"),
            FieldPath::UserId => f.write_str("user_id"),
            FieldPath::ProjectId => f.write_str("project_id"),
            FieldPath::Metadata(key) => write!(f, "metadata.{key}"),
            FieldPath::Unknown(raw) => f.write_str(raw),
        }
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

/// Action executed when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Webhook { url: String },
}

impl Action {
    pub fn webhook(url: impl Into<String>) -> Self {
        Action::Webhook { url: url.into() }
    }
}

/// `event_name` predicate plus exact-equality conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub event_name: String,
    #[serde(default)]
    pub conditions: BTreeMap<FieldPath, MetadataValue>,
    pub actions: Vec<Action>,
}

impl Rule {
    pub fn new(id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event_name: event_name.into(),
            conditions: BTreeMap::new(),
            actions: Vec::new(),
        }
    }

    pub fn when(mut self, path: impl Into<FieldPath>, expected: impl Into<MetadataValue>) -> Self {
        self.conditions.insert(path.into(), expected.into());
        self
    }

    pub fn then(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// True if the event name matches and every condition resolves to exactly the
    /// expected value. No type coercion: `"1"` never equals `1`.
    pub fn matches(&self, event: &Event) -> bool {
        event.event_name == self.event_name
            && self
                .conditions
                .iter()
                .all(|(path, expected)| path.resolve(event).as_ref() == Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_core::{EventId, ProjectId};
    use pulse_events::Metadata;
    use serde_json::json;

    fn event(name: &str, metadata: &[(&str, MetadataValue)]) -> Event {
        let now = Utc::now();
        Event {
            id: EventId::new(),
            project_id: ProjectId::new(),
            event_name: name.to_string(),
            user_id: None,
            timestamp: now,
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Metadata>(),
            received_at: now,
            ip_address: None,
            user_agent: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn parses_field_paths() {
        assert_eq!(FieldPath::from("event_name"), FieldPath::EventName);
        assert_eq!(FieldPath::from("metadata.plan"), FieldPath::Metadata("plan".into()));
        assert_eq!(FieldPath::from("metadata.a.b"), FieldPath::Unknown("metadata.a.b".into()));
        assert_eq!(FieldPath::from("metadata."), FieldPath::Unknown("metadata.".into()));
        assert_eq!(FieldPath::from("colour"), FieldPath::Unknown("colour".into()));
    }

    #[test]
    fn field_paths_round_trip_as_map_keys() {
        let rule: Rule = serde_json::from_value(json!({
            "id": "r1",
            "event_name": "user_signup",
            "conditions": {"metadata.plan": "premium", "user_id": "u1"},
            "actions": [{"type": "webhook", "url": "https://example.com/hook"}],
        }))
        .unwrap();

        assert_eq!(
            rule.conditions.get(&FieldPath::Metadata("plan".into())),
            Some(&MetadataValue::from("premium"))
        );
        assert_eq!(rule.actions, vec![Action::webhook("https://example.com/hook")]);

        let back = serde_json::to_value(&rule).unwrap();
        assert_eq!(back["conditions"]["metadata.plan"], "premium");
        assert_eq!(back["actions"][0]["type"], "webhook");
    }

    #[test]
    fn unknown_paths_never_match() {
        let rule = Rule::new("r", "click").when("colour", "red");
        assert!(!rule.matches(&event("click", &[("colour", "red".into())])));
    }

    #[test]
    fn comparison_does_not_coerce_types() {
        let rule = Rule::new("r", "purchase").when("metadata.qty", 1);
        assert!(rule.matches(&event("purchase", &[("qty", 1.into())])));
        assert!(!rule.matches(&event("purchase", &[("qty", "1".into())])));
    }

    #[test]
    fn missing_user_id_does_not_match_null() {
        let rule = Rule::new("r", "login").when("user_id", MetadataValue::Null);
        assert!(!rule.matches(&event("login", &[])));
    }
}
