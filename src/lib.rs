//! SSH gateway
//!
//! Pools authenticated SSH connections and exposes them through two surfaces:
//! a request/response HTTP API (`api`) and a streaming WebSocket bridge
//! (`bridge`) that drives interactive terminal sessions.

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod policy;
pub mod registry;
pub mod session;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
mod testing;

pub use error::GatewayError;
