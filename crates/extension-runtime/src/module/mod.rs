//! Module boundary
//!
//! A module owns the extension set of one telephony backend, produces the
//! events for those extensions and executes their outbound sends. Backend
//! variants are selected by configuration and share one capability trait.

mod acd;
mod freeswitch;
mod transport;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chart_core::Event;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument, Span};

use crate::bus::EventBus;
use crate::config::{BackendConfig, ExtensionConfig, ExtensionKind, ModuleConfig};
use crate::error::{ConfigError, DispatchError, SendError};

pub use acd::{AcdBackend, OutboundMessage};
pub use freeswitch::{
    parse_event_body, registration_event, FreeSwitchBackend, MIN_STATUS_RESPONSE_LEN,
    STATUS_EVENT,
};
pub use transport::{EventSocket, EventSocketConnector};

/// Send capability the dispatcher forwards `send` actions to.
#[async_trait]
pub trait ModuleSink: Send + Sync {
    async fn send(&self, content: &str, extension: &str) -> Result<(), SendError>;
}

/// Operations every backend variant provides.
#[async_trait]
pub trait BackendCapability: Send + Sync {
    /// Type tag used in configuration.
    fn kind(&self) -> &'static str;

    /// Whether extensions of this type belong to the backend.
    fn accepts(&self, kind: ExtensionKind) -> bool;

    /// Accept or reject an extension based on its type tag.
    fn new_extension(&self, module: &str, config: &ExtensionConfig) -> Result<(), ConfigError> {
        if self.accepts(config.kind) {
            Ok(())
        } else {
            Err(ConfigError::UnsupportedType {
                module: module.to_string(),
                extension: config.id.clone(),
                kind: config.kind,
            })
        }
    }

    /// Execute a send action for `extension`.
    async fn fire_send(&self, content: &str, extension: &str) -> Result<(), SendError>;

    /// Produce events for `extensions` until `cancel` fires.
    async fn produce(
        &self,
        extensions: Vec<ExtensionConfig>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

pub enum Backend {
    Acd(AcdBackend),
    FreeSwitch(FreeSwitchBackend),
}

impl Backend {
    pub fn from_config(
        module: &str,
        config: &BackendConfig,
        connector: Option<Arc<dyn EventSocketConnector>>,
    ) -> Self {
        match config {
            BackendConfig::Acd => Backend::Acd(AcdBackend::new(module)),
            BackendConfig::Freeswitch(settings) => {
                Backend::FreeSwitch(FreeSwitchBackend::new(module, settings.clone(), connector))
            }
        }
    }

    fn capability(&self) -> &dyn BackendCapability {
        match self {
            Backend::Acd(backend) => backend,
            Backend::FreeSwitch(backend) => backend,
        }
    }
}

#[async_trait]
impl BackendCapability for Backend {
    fn kind(&self) -> &'static str {
        self.capability().kind()
    }

    fn accepts(&self, kind: ExtensionKind) -> bool {
        self.capability().accepts(kind)
    }

    async fn fire_send(&self, content: &str, extension: &str) -> Result<(), SendError> {
        self.capability().fire_send(content, extension).await
    }

    async fn produce(
        &self,
        extensions: Vec<ExtensionConfig>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.capability().produce(extensions, events, cancel).await
    }
}

#[async_trait]
impl ModuleSink for Backend {
    async fn send(&self, content: &str, extension: &str) -> Result<(), SendError> {
        self.fire_send(content, extension).await
    }
}

/// A configured backend together with the extensions it owns.
pub struct Module {
    id: String,
    backend: Arc<Backend>,
    extensions: BTreeMap<String, ExtensionConfig>,
    span: Span,
}

impl Module {
    pub fn new(id: impl Into<String>, backend: Backend) -> Self {
        let id = id.into();
        let span = tracing::info_span!("module", module = %id, backend = backend.kind());
        Self {
            id,
            backend: Arc::new(backend),
            extensions: BTreeMap::new(),
            span,
        }
    }

    /// Build a module and its extension set from configuration.
    ///
    /// Rejected entries are returned alongside the module; they do not stop
    /// the remaining entries from loading.
    pub fn from_config(
        config: &ModuleConfig,
        connector: Option<Arc<dyn EventSocketConnector>>,
    ) -> (Self, Vec<ConfigError>) {
        let backend = Backend::from_config(&config.id, &config.backend, connector);
        let mut module = Module::new(config.id.clone(), backend);

        let (accepted, mut rejected) = config.extension_configs();
        for extension in accepted {
            if let Err(err) = module.add_extension(extension) {
                rejected.push(err);
            }
        }
        for err in &rejected {
            tracing::error!(parent: &module.span, error = %err, "extension rejected");
        }

        (module, rejected)
    }

    pub fn add_extension(&mut self, config: ExtensionConfig) -> Result<(), ConfigError> {
        self.backend.new_extension(&self.id, &config)?;
        if self.extensions.contains_key(&config.id) {
            return Err(ConfigError::DuplicateExtension {
                module: self.id.clone(),
                extension: config.id,
            });
        }
        self.extensions.insert(config.id.clone(), config);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Extensions in id order.
    pub fn extensions(&self) -> impl Iterator<Item = &ExtensionConfig> {
        self.extensions.values()
    }

    pub fn extension(&self, id: &str) -> Option<&ExtensionConfig> {
        self.extensions.get(id)
    }

    pub fn sink(&self) -> Arc<dyn ModuleSink> {
        self.backend.clone()
    }

    /// Route ACD sends into `outbox`. Returns false for other backends or
    /// when an outbox is already attached.
    pub fn attach_outbox(&self, outbox: mpsc::UnboundedSender<OutboundMessage>) -> bool {
        match self.backend.as_ref() {
            Backend::Acd(acd) => acd.attach_outbox(outbox),
            Backend::FreeSwitch(_) => false,
        }
    }

    /// Handle for pushing events into the runtime on behalf of this module.
    pub fn handle(&self, events: EventBus) -> ModuleHandle {
        ModuleHandle {
            module: self.id.clone(),
            extensions: Arc::new(self.extensions.keys().cloned().collect()),
            events,
        }
    }

    pub fn spawn_producer(&self, events: EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let extensions: Vec<ExtensionConfig> = self.extensions.values().cloned().collect();

        tokio::spawn(
            async move {
                info!(extensions = extensions.len(), "producer started");
                if let Err(err) = backend.produce(extensions, events, cancel).await {
                    error!(error = %err, "producer failed");
                }
                info!("producer stopped");
            }
            .instrument(self.span.clone()),
        )
    }
}

/// Pushes events stamped with one module's extension ids.
#[derive(Clone)]
pub struct ModuleHandle {
    module: String,
    extensions: Arc<HashSet<String>>,
    events: EventBus,
}

impl ModuleHandle {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn owns(&self, extension: &str) -> bool {
        self.extensions.contains(extension)
    }

    /// Queue an event for one of this module's extensions.
    pub async fn push_event(&self, event: Event) -> Result<(), DispatchError> {
        if !self.owns(&event.target) {
            return Err(DispatchError::UnknownExtension(event.target));
        }
        if self.events.publish(event).await {
            Ok(())
        } else {
            Err(DispatchError::ShuttingDown)
        }
    }
}
