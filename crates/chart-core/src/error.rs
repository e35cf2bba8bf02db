use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error type for chart documents that cannot be turned into a usable chart.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed chart document: {0}")]
    Syntax(#[from] serde_yaml::Error),

    #[error("I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("chart '{0}' declares no states")]
    NoStates(String),

    #[error("state #{0} has an empty id")]
    EmptyStateId(usize),

    #[error("duplicate state id '{0}'")]
    DuplicateState(String),

    #[error("state '{state}' references unknown parent '{parent}'")]
    UnknownParent { state: String, parent: String },

    #[error("state hierarchy contains a cycle through '{0}'")]
    HierarchyCycle(String),

    #[error("initial state '{0}' is not defined")]
    UnknownInitial(String),

    #[error("transition #{index} references unknown {role} state '{state}'")]
    UnknownTransitionState {
        index: usize,
        role: &'static str,
        state: String,
    },

    #[error("transition #{0} has an empty event name")]
    EmptyEvent(usize),

    #[error("transition #{index} has an invalid guard: {message}")]
    InvalidGuard { index: usize, message: String },

    #[error("transition #{index} has an invalid action: {message}")]
    InvalidAction { index: usize, message: String },

    #[error("unknown chart '{0}'")]
    UnknownChart(String),
}

/// Internal inconsistency detected while stepping a machine.
///
/// Load-time validation excludes these for charts produced by the loader, so
/// they indicate a context bound to the wrong chart or a hand-built chart.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpretError {
    #[error("active state '{0}' is not defined in chart '{1}'")]
    UnknownActiveState(String, String),

    #[error("transition target '{0}' is not defined in chart '{1}'")]
    UnknownTarget(String, String),
}
