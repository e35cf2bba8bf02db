//! State machine module
//!
//! Contains the per-extension machine state and the interpreter that advances
//! it by one event.

mod interpreter;
mod state;

pub use interpreter::{step, StepOutcome, TransitionRef};
pub use state::{MachineState, Scope};
