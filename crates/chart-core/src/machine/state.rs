//! Machine state - the mutable part of an extension's execution context

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::model::ChartDefinition;

/// Prefix under which event data is visible to guards and actions.
pub const EVENT_PREFIX: &str = "_event.";

/// Active state and variable bindings of one running chart instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MachineState {
    /// Id of the active state; its ancestors are implicitly active.
    pub active: String,
    pub variables: BTreeMap<String, String>,
}

impl MachineState {
    pub fn new(active: impl Into<String>) -> Self {
        Self {
            active: active.into(),
            variables: BTreeMap::new(),
        }
    }

    /// Create a state at the chart's initial state.
    ///
    /// Declared chart variables start empty, then `bindings` are applied in
    /// order (later bindings win).
    pub fn initial<I, K, V>(chart: &ChartDefinition, bindings: I) -> Option<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let active = chart.initial_state()?;
        let mut variables: BTreeMap<String, String> = chart
            .variables
            .iter()
            .map(|name| (name.clone(), String::new()))
            .collect();
        for (key, value) in bindings {
            variables.insert(key.into(), value.into());
        }
        Some(Self {
            active: active.to_string(),
            variables,
        })
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }
}

/// Read-only view used to evaluate guards and render templates.
///
/// Resolves `_event.name` to the event name, `_event.<field>` to an event
/// field, and anything else to a variable.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    variables: &'a BTreeMap<String, String>,
    event: &'a Event,
}

impl<'a> Scope<'a> {
    pub fn new(variables: &'a BTreeMap<String, String>, event: &'a Event) -> Self {
        Self { variables, event }
    }

    pub fn get(&self, name: &str) -> Option<&'a str> {
        match name.strip_prefix(EVENT_PREFIX) {
            Some("name") => Some(self.event.name.as_str()),
            Some(field) => self.event.fields.get(field).map(String::as_str),
            None => self.variables.get(name).map(String::as_str),
        }
    }

    pub fn get_or_empty(&self, name: &str) -> &'a str {
        self.get(name).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StateDefinition;

    #[test]
    fn test_initial_seeds_declared_variables_then_bindings() {
        let chart = crate::model::ChartDefinition::new(
            "c",
            vec![StateDefinition::new("idle")],
            vec![],
        )
        .with_variables(["caller", "queue"]);

        let state = MachineState::initial(&chart, [("queue", "sales"), ("queue", "support")]).unwrap();
        assert_eq!(state.active, "idle");
        assert_eq!(state.variable("caller"), Some(""));
        assert_eq!(state.variable("queue"), Some("support"));
    }

    #[test]
    fn test_initial_requires_a_state() {
        let chart = crate::model::ChartDefinition::new("empty", vec![], vec![]);
        assert!(MachineState::initial(&chart, Vec::<(String, String)>::new()).is_none());
    }

    #[test]
    fn test_scope_prefers_event_bindings_for_prefix() {
        let mut variables = BTreeMap::new();
        variables.insert("_event.Status".to_string(), "stale".to_string());
        variables.insert("status".to_string(), "local".to_string());
        let event = Event::new("101", "GetStatus").with_field("Status", "Registered");
        let scope = Scope::new(&variables, &event);

        assert_eq!(scope.get("_event.Status"), Some("Registered"));
        assert_eq!(scope.get("_event.name"), Some("GetStatus"));
        assert_eq!(scope.get("status"), Some("local"));
        assert_eq!(scope.get("_event.missing"), None);
    }
}
