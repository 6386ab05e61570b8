//! Rule evaluation.

use pulse_events::Event;

use crate::rule::Rule;

/// How many matching rules fire for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// Every matching rule fires, in rule order.
    #[default]
    FireAll,
    /// Only the first matching rule fires.
    FirstMatch,
}

/// Stateless matcher over a rule list.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEngine {
    mode: MatchMode,
}

impl RuleEngine {
    pub fn new(mode: MatchMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Rules matching `event`, in the order they appear in `rules`.
    ///
    /// Expects `event` to be normalized; the name comparison is exact.
    pub fn evaluate<'r>(&self, event: &Event, rules: &'r [Rule]) -> Vec<&'r Rule> {
        let mut matching = rules.iter().filter(|rule| rule.matches(event));
        match self.mode {
            MatchMode::FireAll => matching.collect(),
            MatchMode::FirstMatch => matching.next().into_iter().collect(),
        }
    }
}
