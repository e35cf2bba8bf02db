use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::machine::Scope;

/// Boolean condition over an extension's variables gating a transition.
///
/// Unbound variables read as the empty string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Guard {
    /// Variable equals the value exactly
    Equals { var: String, value: String },
    /// Variable differs from the value
    NotEquals { var: String, value: String },
    /// Variable contains the value as a substring
    Contains { var: String, value: String },
    /// Variable matches a regex pattern
    Matches {
        var: String,
        pattern: String,
        #[serde(skip)]
        compiled: CompiledPattern,
    },
    /// Variable is bound to a non-empty value
    Defined { var: String },
    /// All conditions must be true
    And { conditions: Vec<Guard> },
    /// At least one condition must be true
    Or { conditions: Vec<Guard> },
    /// Negates the inner condition
    Not { condition: Box<Guard> },
}

/// Regex compiled on first use and kept with its guard.
///
/// `None` records a pattern that failed to compile. Compares equal to any
/// other cache so guards compare by their definition only.
#[derive(Debug, Clone, Default)]
pub struct CompiledPattern(OnceLock<Option<Regex>>);

impl CompiledPattern {
    fn get(&self, pattern: &str) -> Option<&Regex> {
        self.0.get_or_init(|| Regex::new(pattern).ok()).as_ref()
    }

    /// Whether the pattern has been compiled already
    pub fn is_compiled(&self) -> bool {
        self.0.get().is_some()
    }
}

impl PartialEq for CompiledPattern {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for CompiledPattern {}

impl Guard {
    pub fn matches(var: impl Into<String>, pattern: impl Into<String>) -> Self {
        Guard::Matches {
            var: var.into(),
            pattern: pattern.into(),
            compiled: CompiledPattern::default(),
        }
    }

    /// Evaluate the guard against a scope
    pub fn evaluate(&self, scope: &Scope<'_>) -> bool {
        match self {
            Guard::Equals { var, value } => scope.get_or_empty(var) == value,
            Guard::NotEquals { var, value } => scope.get_or_empty(var) != value,
            Guard::Contains { var, value } => scope.get_or_empty(var).contains(value.as_str()),
            Guard::Matches {
                var,
                pattern,
                compiled,
            } => compiled
                .get(pattern)
                .is_some_and(|re| re.is_match(scope.get_or_empty(var))),
            Guard::Defined { var } => !scope.get_or_empty(var).is_empty(),
            Guard::And { conditions } => conditions.iter().all(|c| c.evaluate(scope)),
            Guard::Or { conditions } => conditions.iter().any(|c| c.evaluate(scope)),
            Guard::Not { condition } => !condition.evaluate(scope),
        }
    }

    /// Structural check performed at load time.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Guard::Equals { var, .. }
            | Guard::NotEquals { var, .. }
            | Guard::Contains { var, .. }
            | Guard::Defined { var } => validate_var(var),
            Guard::Matches {
                var,
                pattern,
                compiled,
            } => {
                validate_var(var)?;
                let re = Regex::new(pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
                let _ = compiled.0.set(Some(re));
                Ok(())
            }
            Guard::And { conditions } | Guard::Or { conditions } => {
                conditions.iter().try_for_each(Guard::validate)
            }
            Guard::Not { condition } => condition.validate(),
        }
    }
}

fn validate_var(var: &str) -> Result<(), String> {
    if var.trim().is_empty() {
        return Err("guard variable cannot be empty".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::event::Event;

    fn variables() -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("status".to_string(), "Registered".to_string());
        vars.insert("caller".to_string(), "5551234".to_string());
        vars
    }

    fn equals(var: &str, value: &str) -> Guard {
        Guard::Equals {
            var: var.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_equals_and_not_equals() {
        let vars = variables();
        let event = Event::new("101", "ping");
        let scope = Scope::new(&vars, &event);

        assert!(equals("status", "Registered").evaluate(&scope));
        assert!(!equals("status", "Unregistered").evaluate(&scope));
        assert!(Guard::NotEquals {
            var: "status".to_string(),
            value: "Unregistered".to_string(),
        }
        .evaluate(&scope));
    }

    #[test]
    fn test_unbound_variable_reads_empty() {
        let vars = variables();
        let event = Event::new("101", "ping");
        let scope = Scope::new(&vars, &event);

        assert!(equals("missing", "").evaluate(&scope));
        assert!(!Guard::Defined {
            var: "missing".to_string()
        }
        .evaluate(&scope));
        assert!(Guard::Defined {
            var: "caller".to_string()
        }
        .evaluate(&scope));
    }

    #[test]
    fn test_event_fields_are_visible() {
        let vars = variables();
        let event = Event::new("101", "GetStatus").with_field("Status", "Registered");
        let scope = Scope::new(&vars, &event);

        assert!(equals("_event.Status", "Registered").evaluate(&scope));
        assert!(equals("_event.name", "GetStatus").evaluate(&scope));
    }

    #[test]
    fn test_matches_and_composites() {
        let vars = variables();
        let event = Event::new("101", "ping");
        let scope = Scope::new(&vars, &event);

        let digits = Guard::matches("caller", r"^\d+$");
        assert!(digits.evaluate(&scope));

        let both = Guard::And {
            conditions: vec![digits.clone(), equals("status", "Registered")],
        };
        assert!(both.evaluate(&scope));

        let either = Guard::Or {
            conditions: vec![equals("status", "x"), equals("status", "y")],
        };
        assert!(!either.evaluate(&scope));
        assert!(Guard::Not {
            condition: Box::new(either)
        }
        .evaluate(&scope));
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let guard = Guard::Or {
            conditions: vec![Guard::matches("caller", "(")],
        };
        assert!(guard.validate().is_err());
        assert!(equals(" ", "x").validate().is_err());
        assert!(equals("status", "x").validate().is_ok());
    }

    #[test]
    fn test_pattern_is_compiled_once() {
        let vars = variables();
        let event = Event::new("101", "ping");
        let scope = Scope::new(&vars, &event);

        let guard: Guard = serde_yaml::from_str("{ type: matches, var: status, pattern: '^Reg' }").unwrap();
        let Guard::Matches { compiled, .. } = &guard else {
            panic!("expected a matches guard");
        };
        assert!(!compiled.is_compiled());

        guard.validate().unwrap();
        assert!(compiled.is_compiled());
        assert!(guard.evaluate(&scope));
        assert_eq!(guard, Guard::matches("status", "^Reg"));

        let lazy = Guard::matches("caller", "^555");
        assert!(lazy.evaluate(&scope));
        assert!(matches!(&lazy, Guard::Matches { compiled, .. } if compiled.is_compiled()));
    }

    #[test]
    fn test_yaml_deserialization() {
        let yaml = r#"
type: and
conditions:
  - type: equals
    var: status
    value: Registered
  - type: not
    condition:
      type: defined
      var: busy
"#;
        let guard: Guard = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(guard, Guard::And { ref conditions } if conditions.len() == 2));
    }
}
