//! Interpreter - advances a machine state by one event
//!
//! `step` is a pure function of (chart, state, event). It never mutates its
//! inputs; the caller publishes the returned state.

use crate::action::OutboundAction;
use crate::error::InterpretError;
use crate::event::Event;
use crate::model::ChartDefinition;

use super::state::{MachineState, Scope};

/// Identifies the transition selected by a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRef {
    /// Position of the transition in document order.
    pub index: usize,
    pub source: String,
    pub target: String,
}

/// Result of one interpreter step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// The state after the step; equal to the input when nothing fired.
    pub state: MachineState,
    /// Effects produced by the fired transition, in declared order.
    pub actions: Vec<OutboundAction>,
    /// The transition that fired, if any.
    pub transition: Option<TransitionRef>,
}

impl StepOutcome {
    fn unchanged(state: &MachineState) -> Self {
        Self {
            state: state.clone(),
            actions: Vec::new(),
            transition: None,
        }
    }

    /// Whether the event matched no transition.
    pub fn is_noop(&self) -> bool {
        self.transition.is_none()
    }
}

/// Advance `state` by `event` according to `chart`.
///
/// Candidates are transitions triggered by the event whose source is the
/// active state or one of its ancestors and whose guard holds. The candidate
/// on the deepest active state wins; among those, the earliest declared.
/// No candidate is a no-op, not an error.
pub fn step(
    chart: &ChartDefinition,
    state: &MachineState,
    event: &Event,
) -> Result<StepOutcome, InterpretError> {
    let chain = chart.active_chain(&state.active).ok_or_else(|| {
        InterpretError::UnknownActiveState(state.active.clone(), chart.id.clone())
    })?;

    let mut candidates: Vec<_> = chart
        .transitions_for(&event.name)
        .filter_map(|(index, transition)| {
            chain
                .iter()
                .position(|active| *active == transition.source)
                .map(|depth| (depth, index, transition))
        })
        .collect();
    candidates.sort_by_key(|(depth, index, _)| (*depth, *index));

    let scope = Scope::new(&state.variables, event);
    let selected = candidates.into_iter().find(|(_, _, transition)| {
        transition
            .guard
            .as_ref()
            .map_or(true, |guard| guard.evaluate(&scope))
    });

    let Some((_, index, transition)) = selected else {
        tracing::trace!(
            chart = %chart.id,
            state = %state.active,
            event = %event.name,
            "no transition matched"
        );
        return Ok(StepOutcome::unchanged(state));
    };

    if !chart.contains_state(&transition.target) {
        return Err(InterpretError::UnknownTarget(
            transition.target.clone(),
            chart.id.clone(),
        ));
    }

    let mut variables = state.variables.clone();
    let actions = transition
        .actions
        .iter()
        .map(|action| action.apply(&mut variables, event))
        .collect();

    Ok(StepOutcome {
        state: MachineState {
            active: transition.target.clone(),
            variables,
        },
        actions,
        transition: Some(TransitionRef {
            index,
            source: transition.source.clone(),
            target: transition.target.clone(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionDefinition;
    use crate::guard::Guard;
    use crate::model::{StateDefinition, TransitionDefinition};

    fn call_chart() -> ChartDefinition {
        ChartDefinition::new(
            "call",
            vec![
                StateDefinition::new("Idle"),
                StateDefinition::new("Ringing"),
                StateDefinition::new("Active"),
            ],
            vec![
                TransitionDefinition::new("Idle", "call_start", "Ringing"),
                TransitionDefinition::new("Ringing", "answer", "Active"),
            ],
        )
    }

    fn hierarchical_chart() -> ChartDefinition {
        ChartDefinition::new(
            "agent",
            vec![
                StateDefinition::new("online"),
                StateDefinition::new("busy").with_parent("online"),
                StateDefinition::new("offline"),
                StateDefinition::new("paused"),
            ],
            vec![
                // parent-level handler, declared first
                TransitionDefinition::new("online", "logout", "offline"),
                TransitionDefinition::new("busy", "logout", "paused"),
                TransitionDefinition::new("busy", "pause", "paused")
                    .with_action(ActionDefinition::assign("reason", "first")),
                TransitionDefinition::new("busy", "pause", "offline")
                    .with_action(ActionDefinition::assign("reason", "second")),
            ],
        )
    }

    #[test]
    fn test_basic_flow() {
        let chart = call_chart();
        let idle = MachineState::new("Idle");

        let t1 = step(&chart, &idle, &Event::new("101", "call_start")).unwrap();
        assert!(!t1.is_noop());
        assert_eq!(t1.state.active, "Ringing");

        let t2 = step(&chart, &t1.state, &Event::new("101", "answer")).unwrap();
        assert_eq!(t2.state.active, "Active");
    }

    #[test]
    fn test_unmatched_event_is_noop() {
        let chart = call_chart();
        let idle = MachineState::new("Idle");

        let outcome = step(&chart, &idle, &Event::new("101", "answer")).unwrap();
        assert!(outcome.is_noop());
        assert_eq!(outcome.state, idle);
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn test_deepest_state_wins() {
        let chart = hierarchical_chart();
        let busy = MachineState::new("busy");

        let outcome = step(&chart, &busy, &Event::new("7", "logout")).unwrap();
        assert_eq!(outcome.state.active, "paused");
        assert_eq!(outcome.transition.unwrap().index, 1);
    }

    #[test]
    fn test_ancestor_transition_applies() {
        let chart = hierarchical_chart();
        let online = MachineState::new("online");
        let outcome = step(&chart, &online, &Event::new("7", "logout")).unwrap();
        assert_eq!(outcome.state.active, "offline");
    }

    #[test]
    fn test_first_declared_wins_on_same_state() {
        let chart = hierarchical_chart();
        let busy = MachineState::new("busy");

        let outcome = step(&chart, &busy, &Event::new("7", "pause")).unwrap();
        assert_eq!(outcome.state.active, "paused");
        assert_eq!(outcome.state.variable("reason"), Some("first"));
    }

    #[test]
    fn test_guard_rejection_falls_through() {
        let mut chart = hierarchical_chart();
        chart.transitions[1].guard = Some(Guard::Equals {
            var: "_event.force".to_string(),
            value: "yes".to_string(),
        });
        let busy = MachineState::new("busy");

        let outcome = step(&chart, &busy, &Event::new("7", "logout")).unwrap();
        assert_eq!(outcome.state.active, "offline");

        let forced = Event::new("7", "logout").with_field("force", "yes");
        let outcome = step(&chart, &busy, &forced).unwrap();
        assert_eq!(outcome.state.active, "paused");
    }

    #[test]
    fn test_unknown_active_state_is_error() {
        let chart = call_chart();
        let bogus = MachineState::new("Nowhere");
        assert_eq!(
            step(&chart, &bogus, &Event::new("101", "answer")),
            Err(InterpretError::UnknownActiveState(
                "Nowhere".to_string(),
                "call".to_string()
            ))
        );
    }

    #[test]
    fn test_unknown_target_is_error() {
        let chart = ChartDefinition::new(
            "broken",
            vec![StateDefinition::new("a")],
            vec![TransitionDefinition::new("a", "go", "b")],
        );
        let result = step(&chart, &MachineState::new("a"), &Event::new("1", "go"));
        assert!(matches!(result, Err(InterpretError::UnknownTarget(..))));
    }
}
