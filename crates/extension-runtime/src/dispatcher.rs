//! Dispatcher - owns every extension context and applies events to them
//!
//! At most one interpreter step runs per extension at a time; the
//! per-extension `tokio::sync::Mutex` is fair, so waiting dispatches are
//! served in arrival order. Unrelated extensions never contend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chart_core::{
    step, ChartStore, Event, LogLevel, MachineState, OutboundAction, ParseError, TransitionRef,
};
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn, Span};

use crate::config::ExtensionConfig;
use crate::context::{ContextSnapshot, ExtensionContext};
use crate::error::{ConfigError, DispatchError, RegisterError, SendError};
use crate::module::ModuleSink;

pub type SharedContext = Arc<Mutex<ExtensionContext>>;

/// What one delivered event did to its extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub extension: String,
    pub event: String,
    /// Active state before the step.
    pub previous: String,
    /// Active state after the step.
    pub current: String,
    pub transition: Option<TransitionRef>,
    pub actions: Vec<OutboundAction>,
    /// Send actions the module sink rejected.
    pub failed_sends: usize,
}

impl StepReport {
    pub fn is_noop(&self) -> bool {
        self.transition.is_none()
    }
}

pub struct Dispatcher {
    charts: Arc<ChartStore>,
    contexts: DashMap<String, SharedContext>,
    sinks: DashMap<String, Arc<dyn ModuleSink>>,
    // Held shared by every register/dispatch; shutdown takes it exclusively
    // to wait out in-flight work.
    gate: RwLock<()>,
    closed: AtomicBool,
    span: Span,
}

impl Dispatcher {
    pub fn new(charts: Arc<ChartStore>) -> Self {
        Self::with_span(charts, tracing::info_span!("dispatcher"))
    }

    /// Create a dispatcher whose records are emitted inside `span`.
    pub fn with_span(charts: Arc<ChartStore>, span: Span) -> Self {
        Self {
            charts,
            contexts: DashMap::new(),
            sinks: DashMap::new(),
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
            span,
        }
    }

    pub fn charts(&self) -> &Arc<ChartStore> {
        &self.charts
    }

    /// Create the context of a configured extension at its chart's initial
    /// state.
    ///
    /// A duplicate id is rejected without touching the existing context.
    pub async fn register(&self, config: ExtensionConfig) -> Result<(), RegisterError> {
        let _gate = self.gate.read().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegisterError::ShuttingDown);
        }
        if self.contexts.contains_key(&config.id) {
            return Err(RegisterError::AlreadyExists(config.id));
        }

        let handle = self
            .charts
            .resolve(&config.chart)
            .map_err(|source| chart_error(&config, source))?;
        let initial = self
            .charts
            .get(handle)
            .and_then(|chart| MachineState::initial(&chart, config.initial_bindings()));
        let Some(state) = initial else {
            self.charts.release(handle);
            return Err(chart_error(&config, ParseError::UnknownChart(config.chart.clone())).into());
        };

        match self.contexts.entry(config.id.clone()) {
            Entry::Occupied(_) => {
                self.charts.release(handle);
                Err(RegisterError::AlreadyExists(config.id))
            }
            Entry::Vacant(entry) => {
                debug!(
                    parent: &self.span,
                    extension = %config.id,
                    module = %config.module,
                    chart = %config.chart,
                    state = %state.active,
                    "extension registered"
                );
                let context = ExtensionContext::new(config, handle, state, &self.span);
                entry.insert(Arc::new(Mutex::new(context)));
                Ok(())
            }
        }
    }

    /// Remove an extension and release its chart.
    pub async fn unregister(&self, extension: &str) -> bool {
        let _gate = self.gate.read().await;
        let Some((_, context)) = self.contexts.remove(extension) else {
            return false;
        };
        // Wait for a step already holding the context.
        let context = context.lock().await;
        self.charts.release(context.chart);
        debug!(parent: &self.span, extension, "extension unregistered");
        true
    }

    /// Apply one event to its target extension.
    ///
    /// The new state is published before the resulting actions run, and the
    /// actions run while the extension is still held, so the next event for
    /// the same extension observes both.
    pub async fn dispatch(&self, event: Event) -> Result<StepReport, DispatchError> {
        let _gate = self.gate.read().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }

        let context = self
            .contexts
            .get(&event.target)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DispatchError::UnknownExtension(event.target.clone()))?;
        let mut context = context.lock().await;

        let chart = self
            .charts
            .get(context.chart)
            .ok_or_else(|| DispatchError::ChartUnavailable(event.target.clone()))?;

        let outcome = step(&chart, &context.state, &event).map_err(|source| {
            error!(parent: &context.span, event = %event.name, error = %source, "interpreter step failed");
            DispatchError::Interpret {
                extension: event.target.clone(),
                source,
            }
        })?;

        let previous = std::mem::replace(&mut context.state, outcome.state).active;
        context.last_event_at = Some(Utc::now());

        if let Some(transition) = &outcome.transition {
            debug!(
                parent: &context.span,
                event = %event.name,
                from = %previous,
                to = %transition.target,
                "transition fired"
            );
        }

        let mut failed_sends = 0;
        for action in &outcome.actions {
            if let Err(err) = self.deliver(&context, action).await {
                warn!(parent: &context.span, error = %err, "send failed");
                failed_sends += 1;
            }
        }

        Ok(StepReport {
            extension: event.target,
            event: event.name,
            previous,
            current: context.state.active.clone(),
            transition: outcome.transition,
            actions: outcome.actions,
            failed_sends,
        })
    }

    async fn deliver(
        &self,
        context: &ExtensionContext,
        action: &OutboundAction,
    ) -> Result<(), SendError> {
        match action {
            OutboundAction::Send { target, content } => {
                let extension = target.as_deref().unwrap_or(&context.config.id);
                let sink = self
                    .sinks
                    .get(&context.config.module)
                    .map(|entry| Arc::clone(entry.value()))
                    .ok_or_else(|| SendError::NoSink(context.config.module.clone()))?;
                sink.send(content, extension).await
            }
            OutboundAction::Log { level, message } => {
                log_action(&context.span, *level, message);
                Ok(())
            }
            OutboundAction::Assign { var, value } => {
                debug!(parent: &context.span, var = %var, value = %value, "variable assigned");
                Ok(())
            }
        }
    }

    /// Register a module's send capability, replacing any previous one.
    pub fn attach_sink(&self, module: impl Into<String>, sink: Arc<dyn ModuleSink>) {
        self.sinks.insert(module.into(), sink);
    }

    pub async fn snapshot(&self, extension: &str) -> Option<ContextSnapshot> {
        let context = self
            .contexts
            .get(extension)
            .map(|entry| Arc::clone(entry.value()))?;
        let context = context.lock().await;
        Some(context.snapshot())
    }

    pub fn contains(&self, extension: &str) -> bool {
        self.contexts.contains_key(extension)
    }

    pub fn extension_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .contexts
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting work, wait for in-flight dispatches, then release every
    /// context and its chart. Returns the number of contexts released.
    pub async fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let _gate = self.gate.write().await;

        let ids: Vec<String> = self
            .contexts
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut released = 0;
        for id in ids {
            if let Some((_, context)) = self.contexts.remove(&id) {
                let context = context.lock().await;
                self.charts.release(context.chart);
                released += 1;
            }
        }
        self.sinks.clear();

        info!(parent: &self.span, released, "dispatcher shut down");
        released
    }
}

fn chart_error(config: &ExtensionConfig, source: ParseError) -> ConfigError {
    ConfigError::Chart {
        extension: config.id.clone(),
        chart: config.chart.clone(),
        source,
    }
}

fn log_action(span: &Span, level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(parent: span, "{message}"),
        LogLevel::Debug => tracing::debug!(parent: span, "{message}"),
        LogLevel::Info => tracing::info!(parent: span, "{message}"),
        LogLevel::Warn => tracing::warn!(parent: span, "{message}"),
        LogLevel::Error => tracing::error!(parent: span, "{message}"),
    }
}
