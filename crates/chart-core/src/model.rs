//! Chart definitions - structural form of a parsed state chart
//!
//! A `ChartDefinition` is immutable once loaded and shared read-only by every
//! extension bound to it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::action::ActionDefinition;
use crate::guard::Guard;

/// One node of the chart.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StateDefinition {
    /// Unique, non-empty id within the chart.
    pub id: String,
    /// Human readable name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Enclosing state, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl StateDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

/// An edge between two states, triggered by an event name.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransitionDefinition {
    pub source: String,
    pub target: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
    /// Applied in declared order when the transition fires.
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

impl TransitionDefinition {
    pub fn new(
        source: impl Into<String>,
        event: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            event: event.into(),
            guard: None,
            actions: Vec::new(),
        }
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_action(mut self, action: ActionDefinition) -> Self {
        self.actions.push(action);
        self
    }
}

/// One parsed state chart.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChartDefinition {
    #[serde(default)]
    pub id: String,
    /// Initial state id; the first declared state when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,
    /// Declared variable names, seeded empty in every context.
    #[serde(default)]
    pub variables: Vec<String>,
    pub states: Vec<StateDefinition>,
    /// Document order is significant for tie-breaking.
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
    #[serde(skip)]
    state_index: HashMap<String, usize>,
}

impl ChartDefinition {
    /// Build a chart from its parts. No validation is performed; use
    /// [`crate::loader::validate`] for that.
    pub fn new(
        id: impl Into<String>,
        states: Vec<StateDefinition>,
        transitions: Vec<TransitionDefinition>,
    ) -> Self {
        let mut chart = Self {
            id: id.into(),
            initial: None,
            variables: Vec::new(),
            states,
            transitions,
            state_index: HashMap::new(),
        };
        chart.rebuild_index();
        chart
    }

    pub fn with_initial(mut self, initial: impl Into<String>) -> Self {
        self.initial = Some(initial.into());
        self
    }

    pub fn with_variables<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables = variables.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn rebuild_index(&mut self) {
        self.state_index = self
            .states
            .iter()
            .enumerate()
            .map(|(position, state)| (state.id.clone(), position))
            .collect();
    }

    pub fn state(&self, id: &str) -> Option<&StateDefinition> {
        self.state_index.get(id).map(|&position| &self.states[position])
    }

    pub fn contains_state(&self, id: &str) -> bool {
        self.state_index.contains_key(id)
    }

    /// The state every new context starts in.
    pub fn initial_state(&self) -> Option<&str> {
        match &self.initial {
            Some(initial) => Some(initial.as_str()),
            None => self.states.first().map(|state| state.id.as_str()),
        }
    }

    /// The given state followed by its ancestors, deepest first.
    ///
    /// Returns `None` when `id` is not a state of this chart.
    pub fn active_chain(&self, id: &str) -> Option<Vec<&str>> {
        let mut current = self.state(id)?;
        let mut chain = vec![current.id.as_str()];

        // Bounded by the state count so a hand-built cyclic chart cannot spin.
        while let Some(parent) = current.parent.as_deref() {
            if chain.len() > self.states.len() {
                break;
            }
            match self.state(parent) {
                Some(state) => {
                    chain.push(state.id.as_str());
                    current = state;
                }
                None => break,
            }
        }

        Some(chain)
    }

    /// Transitions triggered by `event`, with their document positions.
    pub fn transitions_for<'a>(
        &'a self,
        event: &'a str,
    ) -> impl Iterator<Item = (usize, &'a TransitionDefinition)> + 'a {
        self.transitions
            .iter()
            .enumerate()
            .filter(move |(_, transition)| transition.event == event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_chart() -> ChartDefinition {
        ChartDefinition::new(
            "nested",
            vec![
                StateDefinition::new("root"),
                StateDefinition::new("busy").with_parent("root"),
                StateDefinition::new("ringing").with_parent("busy"),
            ],
            vec![],
        )
    }

    #[test]
    fn test_active_chain_is_deepest_first() {
        let chart = nested_chart();
        assert_eq!(
            chart.active_chain("ringing"),
            Some(vec!["ringing", "busy", "root"])
        );
        assert_eq!(chart.active_chain("root"), Some(vec!["root"]));
        assert_eq!(chart.active_chain("missing"), None);
    }

    #[test]
    fn test_initial_state_defaults_to_first_declared() {
        let chart = nested_chart();
        assert_eq!(chart.initial_state(), Some("root"));

        let chart = nested_chart().with_initial("busy");
        assert_eq!(chart.initial_state(), Some("busy"));
    }

    #[test]
    fn test_active_chain_stops_on_cycle() {
        let chart = ChartDefinition::new(
            "cyclic",
            vec![
                StateDefinition::new("a").with_parent("b"),
                StateDefinition::new("b").with_parent("a"),
            ],
            vec![],
        );
        let chain = chart.active_chain("a").unwrap();
        assert!(chain.len() <= 3);
    }
}
