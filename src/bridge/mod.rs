//! WebSocket Bridge module
//!
//! The streaming surface: JSON wire protocol, the WebSocket listener, the
//! registry of live interactive sessions and the per-client channel cap.

mod limiter;
mod manager;
mod protocol;
mod server;

pub use limiter::{ClientLimiter, ClientPermit};
pub use manager::{BridgeManager, SessionInfo, SessionSummary};
pub use protocol::{
    ClientMessage, CommandPayload, ExecutePayload, ProtocolError, ServerMessage, MAX_MESSAGE_SIZE,
};
pub use server::{DisconnectReason, WsBridge, EXECUTE_PATH, INTERACTIVE_PATH};
