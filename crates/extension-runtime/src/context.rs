//! Live extension instances

use std::collections::BTreeMap;

use chart_core::{ChartHandle, MachineState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Span;

use crate::config::ExtensionConfig;

/// Mutable runtime instance of one configured extension.
///
/// Owned by the dispatcher; only touched while holding the extension's lock.
#[derive(Debug)]
pub struct ExtensionContext {
    pub(crate) config: ExtensionConfig,
    pub(crate) chart: ChartHandle,
    pub(crate) state: MachineState,
    pub(crate) last_event_at: Option<DateTime<Utc>>,
    pub(crate) span: Span,
}

impl ExtensionContext {
    pub(crate) fn new(
        config: ExtensionConfig,
        chart: ChartHandle,
        state: MachineState,
        parent: &Span,
    ) -> Self {
        let span = tracing::info_span!(
            parent: parent,
            "extension",
            extension = %config.id,
            module = %config.module
        );
        Self {
            config,
            chart,
            state,
            last_event_at: None,
            span,
        }
    }

    pub fn config(&self) -> &ExtensionConfig {
        &self.config
    }

    pub fn chart(&self) -> ChartHandle {
        self.chart
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.last_event_at
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            extension: self.config.id.clone(),
            module: self.config.module.clone(),
            active: self.state.active.clone(),
            variables: self.state.variables.clone(),
            last_event_at: self.last_event_at,
        }
    }
}

/// Consistent copy of an extension's observable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    pub extension: String,
    pub module: String,
    pub active: String,
    pub variables: BTreeMap<String, String>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl ContextSnapshot {
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }
}
