//! extension-runtime - extension registry and event routing
//!
//! Modules produce events for their extensions into a shared bus; the router
//! hands each event to its extension's lane, and the dispatcher steps the
//! extension's chart and forwards the resulting sends back to the module.

pub mod bus;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod module;
pub mod router;
pub mod runtime;

pub use bus::EventBus;
pub use config::{
    BackendConfig, ExtensionConfig, ExtensionEntry, ExtensionKind, ExtensionSlot,
    FreeSwitchConfig, ModuleConfig, RuntimeConfig, CHART_DIR_ENV, EXTENSION_VARIABLE,
};
pub use context::{ContextSnapshot, ExtensionContext};
pub use dispatcher::{Dispatcher, StepReport};
pub use error::{ConfigError, DispatchError, RegisterError, SendError};
pub use module::{
    AcdBackend, Backend, BackendCapability, EventSocket, EventSocketConnector, FreeSwitchBackend,
    Module, ModuleHandle, ModuleSink, OutboundMessage,
};
pub use router::{Router, RouterStats, DEFAULT_LANE_CAPACITY};
pub use runtime::{RegisterFailure, Runtime, RuntimeError, StartReport, StopReport};
