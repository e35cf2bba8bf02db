//! Transition actions and the outbound effects they produce.
//!
//! Every string field of an action is a template: `${name}` expands to the
//! value of `name` in the evaluation scope, or to nothing when unbound.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::machine::Scope;

/// Severity attached to a `log` action.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// An action declared on a transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ActionDefinition {
    /// Bind a variable; later actions of the same transition see the new value
    Assign { var: String, value: String },
    /// Send content to the owning module
    Send {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Emit a log record in the extension's span
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },
}

/// Effect produced by a transition, executed by the dispatcher after the step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OutboundAction {
    Send {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        content: String,
    },
    Log { level: LogLevel, message: String },
    Assign { var: String, value: String },
}

impl ActionDefinition {
    pub fn assign(var: impl Into<String>, value: impl Into<String>) -> Self {
        ActionDefinition::Assign {
            var: var.into(),
            value: value.into(),
        }
    }

    pub fn send(content: impl Into<String>) -> Self {
        ActionDefinition::Send {
            content: content.into(),
            target: None,
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        ActionDefinition::Log {
            message: message.into(),
            level: LogLevel::Info,
        }
    }

    /// Apply the action to the working variables and describe its effect.
    pub fn apply(&self, variables: &mut BTreeMap<String, String>, event: &Event) -> OutboundAction {
        match self {
            ActionDefinition::Assign { var, value } => {
                let value = render(value, &Scope::new(variables, event));
                variables.insert(var.clone(), value.clone());
                OutboundAction::Assign {
                    var: var.clone(),
                    value,
                }
            }
            ActionDefinition::Send { content, target } => {
                let scope = Scope::new(variables, event);
                OutboundAction::Send {
                    target: target.as_deref().map(|target| render(target, &scope)),
                    content: render(content, &scope),
                }
            }
            ActionDefinition::Log { message, level } => OutboundAction::Log {
                level: *level,
                message: render(message, &Scope::new(variables, event)),
            },
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ActionDefinition::Assign { var, .. } if var.trim().is_empty() => {
                Err("assign variable cannot be empty".to_string())
            }
            ActionDefinition::Assign { var, .. } if var.starts_with("_event.") => {
                Err(format!("'{var}' is read-only"))
            }
            _ => Ok(()),
        }
    }
}

/// Expand `${name}` placeholders against the scope.
pub fn render(template: &str, scope: &Scope<'_>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                output.push_str(scope.get_or_empty(after[..end].trim()));
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder is kept literally
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}
