//! Chart loader - parses and validates chart documents
//!
//! Documents are YAML (JSON is accepted as a subset). Transitions may be
//! declared in the top-level `transitions` list or nested under a state's
//! `transitions` key, in which case `source` defaults to that state. Nested
//! transitions are hoisted ahead of the top-level list, in state order.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::error::ParseError;
use crate::model::ChartDefinition;

/// Parse and validate a chart document.
pub fn load(source: &str) -> Result<ChartDefinition, ParseError> {
    let mut value: Value = serde_yaml::from_str(source)?;
    normalize_definition(&mut value);

    let mut chart: ChartDefinition = serde_yaml::from_value(value)?;
    chart.rebuild_index();
    validate(&chart)?;
    Ok(chart)
}

/// Read, parse and validate a chart file.
pub fn load_file(path: &Path) -> Result<ChartDefinition, ParseError> {
    let content = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut chart = load(&content)?;
    if chart.id.trim().is_empty() {
        chart.id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    Ok(chart)
}

/// Check the structural invariants of a chart.
pub fn validate(chart: &ChartDefinition) -> Result<(), ParseError> {
    if chart.states.is_empty() {
        return Err(ParseError::NoStates(chart.id.clone()));
    }

    let mut seen = HashSet::with_capacity(chart.states.len());
    for (position, state) in chart.states.iter().enumerate() {
        if state.id.trim().is_empty() {
            return Err(ParseError::EmptyStateId(position));
        }
        if !seen.insert(state.id.as_str()) {
            return Err(ParseError::DuplicateState(state.id.clone()));
        }
    }

    for state in &chart.states {
        if let Some(parent) = &state.parent {
            if !chart.contains_state(parent) {
                return Err(ParseError::UnknownParent {
                    state: state.id.clone(),
                    parent: parent.clone(),
                });
            }
        }
    }
    check_hierarchy(chart)?;

    if let Some(initial) = &chart.initial {
        if !chart.contains_state(initial) {
            return Err(ParseError::UnknownInitial(initial.clone()));
        }
    }

    for (index, transition) in chart.transitions.iter().enumerate() {
        for (role, state) in [("source", &transition.source), ("target", &transition.target)] {
            if !chart.contains_state(state) {
                return Err(ParseError::UnknownTransitionState {
                    index,
                    role,
                    state: state.clone(),
                });
            }
        }
        if transition.event.trim().is_empty() {
            return Err(ParseError::EmptyEvent(index));
        }
        if let Some(guard) = &transition.guard {
            guard
                .validate()
                .map_err(|message| ParseError::InvalidGuard { index, message })?;
        }
        for action in &transition.actions {
            action
                .validate()
                .map_err(|message| ParseError::InvalidAction { index, message })?;
        }
    }

    Ok(())
}

fn check_hierarchy(chart: &ChartDefinition) -> Result<(), ParseError> {
    for state in &chart.states {
        let mut visited = HashSet::new();
        let mut current = Some(state);
        while let Some(node) = current {
            if !visited.insert(node.id.as_str()) {
                return Err(ParseError::HierarchyCycle(state.id.clone()));
            }
            current = node.parent.as_deref().and_then(|parent| chart.state(parent));
        }
    }
    Ok(())
}

fn normalize_definition(definition: &mut Value) {
    let Some(mapping) = definition.as_mapping_mut() else {
        return;
    };

    let mut hoisted = Vec::new();
    if let Some(Value::Sequence(states)) = mapping.get_mut(&yaml_key("states")) {
        for state in states.iter_mut() {
            if let Some(state) = state.as_mapping_mut() {
                hoist_nested_transitions(state, &mut hoisted);
            }
        }
    }

    if hoisted.is_empty() {
        return;
    }

    let transitions_key = yaml_key("transitions");
    if let Some(Value::Sequence(existing)) = mapping.get(&transitions_key) {
        hoisted.extend(existing.iter().cloned());
    }
    mapping.insert(transitions_key, Value::Sequence(hoisted));
}

fn hoist_nested_transitions(state: &mut Mapping, hoisted: &mut Vec<Value>) {
    let Some(Value::Sequence(nested)) = state.remove(&yaml_key("transitions")) else {
        return;
    };
    let source = state.get(&yaml_key("id")).cloned().unwrap_or(Value::Null);

    for mut transition in nested {
        if let Some(transition) = transition.as_mapping_mut() {
            let source_key = yaml_key("source");
            if !transition.contains_key(&source_key) {
                transition.insert(source_key, source.clone());
            }
        }
        hoisted.push(transition);
    }
}

fn yaml_key(key: &str) -> Value {
    Value::String(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALL_CHART: &str = r#"
id: basic-call
variables: [caller]
states:
  - id: Idle
    name: Idle
    description: Waiting for calls
  - id: Ringing
  - id: Active
transitions:
  - source: Idle
    target: Ringing
    event: call_start
    actions:
      - type: assign
        var: caller
        value: "${_event.caller}"
  - source: Ringing
    target: Active
    event: answer
"#;

    #[test]
    fn test_load_basic_chart() {
        let chart = load(CALL_CHART).unwrap();
        assert_eq!(chart.id, "basic-call");
        assert_eq!(chart.states.len(), 3);
        assert_eq!(chart.transitions.len(), 2);
        assert_eq!(chart.initial_state(), Some("Idle"));
        assert_eq!(chart.state("Idle").unwrap().description, "Waiting for calls");
    }

    #[test]
    fn test_load_is_deterministic() {
        assert_eq!(load(CALL_CHART).unwrap(), load(CALL_CHART).unwrap());
    }

    #[test]
    fn test_nested_transitions_are_hoisted_first() {
        let yaml = r#"
states:
  - id: a
    transitions:
      - { event: go, target: b }
  - id: b
transitions:
  - { source: b, event: back, target: a }
"#;
        let chart = load(yaml).unwrap();
        assert_eq!(chart.transitions.len(), 2);
        assert_eq!(chart.transitions[0].source, "a");
        assert_eq!(chart.transitions[0].event, "go");
        assert_eq!(chart.transitions[1].event, "back");
    }

    #[test]
    fn test_json_documents_are_accepted() {
        let json = r#"{"states": [{"id": "x"}], "transitions": [{"source": "x", "target": "x", "event": "tick"}]}"#;
        let chart = load(json).unwrap();
        assert_eq!(chart.transitions[0].event, "tick");
    }

    #[test]
    fn test_rejects_duplicate_state() {
        let yaml = "states:\n  - id: a\n  - id: a\n";
        assert!(matches!(load(yaml), Err(ParseError::DuplicateState(id)) if id == "a"));
    }

    #[test]
    fn test_rejects_unknown_transition_state() {
        let yaml = "states:\n  - id: a\ntransitions:\n  - { source: a, target: z, event: go }\n";
        assert!(matches!(
            load(yaml),
            Err(ParseError::UnknownTransitionState { role: "target", .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_parent_and_cycles() {
        let yaml = "states:\n  - { id: a, parent: nope }\n";
        assert!(matches!(load(yaml), Err(ParseError::UnknownParent { .. })));

        let yaml = "states:\n  - { id: a, parent: b }\n  - { id: b, parent: a }\n";
        assert!(matches!(load(yaml), Err(ParseError::HierarchyCycle(_))));
    }

    #[test]
    fn test_rejects_structural_problems() {
        assert!(matches!(load("states: []"), Err(ParseError::NoStates(_))));
        assert!(matches!(
            load("states:\n  - id: ''\n"),
            Err(ParseError::EmptyStateId(0))
        ));
        assert!(matches!(
            load("initial: b\nstates:\n  - id: a\n"),
            Err(ParseError::UnknownInitial(_))
        ));
        assert!(matches!(
            load("states:\n  - id: a\ntransitions:\n  - { source: a, target: a, event: ' ' }\n"),
            Err(ParseError::EmptyEvent(0))
        ));
        assert!(matches!(load("states: [: bad"), Err(ParseError::Syntax(_))));
    }

    #[test]
    fn test_rejects_invalid_guard_pattern() {
        let yaml = r#"
states: [{ id: a }]
transitions:
  - source: a
    target: a
    event: go
    guard: { type: matches, var: caller, pattern: "(" }
"#;
        assert!(matches!(load(yaml), Err(ParseError::InvalidGuard { index: 0, .. })));
    }

    #[test]
    fn test_load_file_defaults_id_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        fs::write(&path, "states:\n  - id: idle\n").unwrap();

        let chart = load_file(&path).unwrap();
        assert_eq!(chart.id, "agent");

        let missing = load_file(&dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ParseError::Io { .. })));
    }
}
