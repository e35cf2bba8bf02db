//! Runtime - wires charts, dispatcher, router and modules together

use std::collections::HashSet;
use std::sync::Arc;

use chart_core::{ChartStore, Event};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument, Span};

use crate::bus::EventBus;
use crate::config::RuntimeConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, RegisterError};
use crate::module::{EventSocketConnector, Module, ModuleHandle, OutboundMessage};
use crate::router::{Router, RouterStats};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("runtime already started")]
    AlreadyStarted,
}

/// One extension that could not be registered at start.
#[derive(Debug)]
pub struct RegisterFailure {
    pub module: String,
    pub extension: String,
    pub error: RegisterError,
}

#[derive(Debug, Default)]
pub struct StartReport {
    /// Registered extension ids, in module then id order.
    pub registered: Vec<String>,
    pub failures: Vec<RegisterFailure>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Producers that did not finish within the stop timeout and were aborted.
    pub producers_aborted: usize,
    pub router: RouterStats,
    /// Contexts released by the dispatcher.
    pub released: usize,
}

pub struct Runtime {
    config: RuntimeConfig,
    dispatcher: Arc<Dispatcher>,
    modules: Vec<Module>,
    rejected: Vec<ConfigError>,
    bus: EventBus,
    receiver: Option<mpsc::Receiver<Event>>,
    cancel: CancellationToken,
    router_shutdown: CancellationToken,
    producers: Vec<JoinHandle<()>>,
    router: Option<JoinHandle<RouterStats>>,
    span: Span,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a runtime whose FreeSWITCH modules connect through `connector`.
    pub fn with_connector(config: RuntimeConfig, connector: Arc<dyn EventSocketConnector>) -> Self {
        Self::build(config, Some(connector))
    }

    fn build(config: RuntimeConfig, connector: Option<Arc<dyn EventSocketConnector>>) -> Self {
        let span = tracing::info_span!("runtime");
        let charts = Arc::new(ChartStore::with_chart_dir(&config.chart_dir));
        let dispatcher = Arc::new(Dispatcher::with_span(
            charts,
            tracing::info_span!(parent: &span, "dispatcher"),
        ));

        let mut modules = Vec::with_capacity(config.modules.len());
        let mut rejected = Vec::new();
        let mut module_ids = HashSet::new();
        for module_config in &config.modules {
            if !module_ids.insert(module_config.id.clone()) {
                error!(parent: &span, module = %module_config.id, "duplicate module id; skipped");
                rejected.push(ConfigError::DuplicateModule(module_config.id.clone()));
                continue;
            }
            let (module, errors) = Module::from_config(module_config, connector.clone());
            rejected.extend(errors);
            modules.push(module);
        }

        let (bus, receiver) = EventBus::new(config.channel_capacity);
        Self {
            config,
            dispatcher,
            modules,
            rejected,
            bus,
            receiver: Some(receiver),
            cancel: CancellationToken::new(),
            router_shutdown: CancellationToken::new(),
            producers: Vec::new(),
            router: None,
            span,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn charts(&self) -> &Arc<ChartStore> {
        self.dispatcher.charts()
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn module(&self, id: &str) -> Option<&Module> {
        self.modules.iter().find(|module| module.id() == id)
    }

    /// Configuration entries rejected while building the modules.
    pub fn rejected(&self) -> &[ConfigError] {
        &self.rejected
    }

    pub fn handle(&self, module: &str) -> Option<ModuleHandle> {
        self.module(module).map(|module| module.handle(self.bus.clone()))
    }

    /// Route the sends of every ACD module into `outbox`.
    pub fn attach_acd_outbox(&self, outbox: mpsc::UnboundedSender<OutboundMessage>) -> usize {
        self.modules
            .iter()
            .filter(|module| module.attach_outbox(outbox.clone()))
            .count()
    }

    pub fn is_running(&self) -> bool {
        self.router.is_some()
    }

    /// Register every configured extension, then start the router and one
    /// producer per module.
    ///
    /// Extensions that fail to register are reported and skipped.
    pub async fn start(&mut self) -> Result<StartReport, RuntimeError> {
        let Some(receiver) = self.receiver.take() else {
            return Err(RuntimeError::AlreadyStarted);
        };

        let mut report = StartReport::default();
        for module in &self.modules {
            for extension in module.extensions() {
                match self.dispatcher.register(extension.clone()).await {
                    Ok(()) => report.registered.push(extension.id.clone()),
                    Err(err) => {
                        error!(
                            parent: &self.span,
                            module = %module.id(),
                            extension = %extension.id,
                            error = %err,
                            "extension registration failed"
                        );
                        report.failures.push(RegisterFailure {
                            module: module.id().to_string(),
                            extension: extension.id.clone(),
                            error: err,
                        });
                    }
                }
            }
            self.dispatcher.attach_sink(module.id(), module.sink());
        }

        let router = Router::with_span(
            Arc::clone(&self.dispatcher),
            tracing::info_span!(parent: &self.span, "router"),
        )
        .with_lane_capacity(self.config.lane_capacity);
        self.router = Some(router.spawn(receiver, self.router_shutdown.clone()));

        for module in &self.modules {
            self.producers
                .push(module.spawn_producer(self.bus.clone(), self.cancel.child_token()));
        }

        info!(
            parent: &self.span,
            modules = self.modules.len(),
            registered = report.registered.len(),
            failed = report.failures.len(),
            "runtime started"
        );
        Ok(report)
    }

    /// Stop producers, drain queued events and release every extension.
    ///
    /// Producers get `stop_timeout` in total to observe cancellation; any
    /// still running after that are aborted.
    pub async fn stop(&mut self) -> StopReport {
        let mut report = StopReport::default();
        self.cancel.cancel();

        let deadline = Instant::now() + self.config.stop_timeout();
        let producers = std::mem::take(&mut self.producers);
        for mut producer in producers {
            match tokio::time::timeout_at(deadline, &mut producer).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(parent: &self.span, error = %err, "producer task failed"),
                Err(_) => {
                    warn!(parent: &self.span, "producer did not stop in time; aborting");
                    producer.abort();
                    report.producers_aborted += 1;
                }
            }
        }

        self.router_shutdown.cancel();
        if let Some(router) = self.router.take() {
            match router.await {
                Ok(stats) => report.router = stats,
                Err(err) => error!(parent: &self.span, error = %err, "router task failed"),
            }
        }

        report.released = self
            .dispatcher
            .shutdown()
            .instrument(self.span.clone())
            .await;
        info!(
            parent: &self.span,
            released = report.released,
            aborted = report.producers_aborted,
            "runtime stopped"
        );
        report
    }
}
