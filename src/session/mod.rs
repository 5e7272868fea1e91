//! Session Protocol Engine
//!
//! Per-client interactive sessions on the streaming surface: the lifecycle
//! state machine, the actor that drives it, and command history.

mod engine;
mod history;
mod state;

pub use engine::{InteractiveSession, SessionConfig, SessionContext};
pub use history::{CommandHistory, HistoryDirection, HistoryEntry, MAX_HISTORY};
pub use state::{SessionState, SessionStateMachine, StateTransitionError};
