//! Leases on pooled connections

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use super::pool::{close_detached, KeyPool, PooledConnection};
use crate::ssh::{ConnectionKey, RemoteTransport};

/// How a lease shares its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseMode {
    /// Sole user of the connection (interactive sessions)
    Exclusive,
    /// May coexist with other shared leases (one-shot operations)
    Shared,
}

impl fmt::Display for LeaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclusive => write!(f, "exclusive"),
            Self::Shared => write!(f, "shared"),
        }
    }
}

/// Right to use one pooled connection. Dropping the lease releases it.
pub struct Lease {
    conn: Arc<PooledConnection>,
    pool: Arc<KeyPool>,
    mode: LeaseMode,
}

impl Lease {
    pub(crate) fn new(conn: Arc<PooledConnection>, pool: Arc<KeyPool>, mode: LeaseMode) -> Self {
        Self { conn, pool, mode }
    }

    pub fn key(&self) -> &ConnectionKey {
        self.conn.key()
    }

    pub fn mode(&self) -> LeaseMode {
        self.mode
    }

    /// Registry-assigned id of the leased connection
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    /// Claim the connection for one operation.
    ///
    /// Shared leases on a transport that cannot multiplex channels wait here
    /// until the connection is free, so operations never interleave.
    pub async fn begin_operation(&self) -> OperationGuard<'_> {
        let permit = if self.mode == LeaseMode::Shared && !self.conn.transport().is_multiplexed() {
            Some(self.conn.op_lock.clone().lock_owned().await)
        } else {
            None
        };
        self.conn.touch();
        OperationGuard {
            lease: self,
            _permit: permit,
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.conn.id())
            .field("endpoint", &self.conn.key().endpoint())
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.pool.release(&self.conn, self.mode) {
            close_detached(conn);
        }
    }
}

/// Access to the transport for the duration of one operation
pub struct OperationGuard<'a> {
    lease: &'a Lease,
    _permit: Option<OwnedMutexGuard<()>>,
}

impl OperationGuard<'_> {
    pub fn transport(&self) -> &Arc<dyn RemoteTransport> {
        self.lease.conn.transport()
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.lease.conn.touch();
    }
}
