//! chart-core - State chart model, loader and interpreter
//!
//! This crate provides the declarative chart definitions that drive each
//! extension, the loader that validates them, the shared chart arena, and the
//! pure interpreter that advances a machine state by one event.

pub mod action;
pub mod error;
pub mod event;
pub mod guard;
pub mod loader;
pub mod machine;
pub mod model;
pub mod store;

// Re-export commonly used types
pub use action::{ActionDefinition, LogLevel, OutboundAction};
pub use error::{InterpretError, ParseError};
pub use event::{Event, EventError};
pub use guard::{CompiledPattern, Guard};
pub use loader::load;
pub use machine::{step, MachineState, Scope, StepOutcome, TransitionRef};
pub use model::{ChartDefinition, StateDefinition, TransitionDefinition};
pub use store::{ChartHandle, ChartStore};
