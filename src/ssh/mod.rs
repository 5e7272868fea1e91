//! SSH connectivity
//!
//! - `key`: connection identity and request validation
//! - `transport`: the traits the rest of the gateway programs against
//! - `client`: russh implementation of those traits

pub mod client;
pub mod key;
pub mod transport;

pub use client::{RusshConnector, RusshTransport};
pub use key::{validate_command, ConnectRequest, ConnectionKey, Credential, TerminalSize};
pub use transport::{
    ExecChannel, ExecEvent, RemoteConnector, RemoteReader, RemoteTransport, RemoteWriter,
};
