//! Pooled connections and the per-key pool
//!
//! Lock order: `KeyPool::connections` first, then `PooledConnection::state`.
//! Every change to a lease count happens with both held, which makes lease,
//! release, disconnect and the idle sweep mutually exclusive per key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::lease::LeaseMode;
use crate::ssh::{ConnectionKey, RemoteTransport};

#[derive(Debug)]
pub(crate) struct LeaseState {
    pub leases: usize,
    pub exclusive: bool,
    pub last_activity: Instant,
    /// Removed from the pool; closes once the last lease is released
    pub retired: bool,
}

/// A live, authenticated transport owned by the registry
pub struct PooledConnection {
    id: u64,
    key: ConnectionKey,
    transport: Arc<dyn RemoteTransport>,
    created_at: Instant,
    pub(crate) state: Mutex<LeaseState>,
    /// Serializes operations on transports without channel multiplexing
    pub(crate) op_lock: Arc<tokio::sync::Mutex<()>>,
    closed: AtomicBool,
}

impl PooledConnection {
    pub(crate) fn new(id: u64, key: ConnectionKey, transport: Arc<dyn RemoteTransport>) -> Self {
        let now = Instant::now();
        Self {
            id,
            key,
            transport,
            created_at: now,
            state: Mutex::new(LeaseState {
                leases: 0,
                exclusive: false,
                last_activity: now,
                retired: false,
            }),
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn transport(&self) -> &Arc<dyn RemoteTransport> {
        &self.transport
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    /// Flag the connection closed. Caller holds `state` with zero leases.
    fn mark_closed(&self, state: &LeaseState) {
        debug_assert_eq!(state.leases, 0, "closing a connection that is still leased");
        self.closed.store(true, Ordering::Release);
    }

    /// Close the underlying transport. Only reached after `mark_closed`.
    pub(crate) async fn close_transport(&self) {
        debug!("Closing pooled connection #{} ({})", self.id, self.key.endpoint());
        self.transport.close().await;
    }
}

/// Close on whatever runtime is current; dropped leases may not be in async context.
pub(crate) fn close_detached(conn: Arc<PooledConnection>) {
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move { conn.close_transport().await });
        }
        Err(_) => debug!(
            "No runtime to close connection #{}; dropping transport",
            conn.id()
        ),
    }
}

/// All pooled connections sharing one key
#[derive(Default)]
pub(crate) struct KeyPool {
    connections: Mutex<Vec<Arc<PooledConnection>>>,
    /// Held while a new connection for this key is being established
    pub connecting: tokio::sync::Mutex<()>,
}

impl KeyPool {
    /// Take a lease on an eligible connection, if any.
    ///
    /// Exclusive requests only match unreferenced connections. Shared requests
    /// match anything not exclusively held, preferring the least loaded.
    pub fn try_acquire(&self, mode: LeaseMode) -> Option<Arc<PooledConnection>> {
        let connections = self.connections.lock();
        let mut best: Option<(&Arc<PooledConnection>, usize)> = None;

        for conn in connections.iter() {
            let state = conn.state.lock();
            if state.retired || state.exclusive {
                continue;
            }
            let eligible = match mode {
                LeaseMode::Exclusive => state.leases == 0,
                LeaseMode::Shared => true,
            };
            if eligible && best.map_or(true, |(_, load)| state.leases < load) {
                best = Some((conn, state.leases));
            }
        }

        let (conn, _) = best?;
        let mut state = conn.state.lock();
        state.leases += 1;
        state.exclusive = mode == LeaseMode::Exclusive;
        state.last_activity = Instant::now();
        Some(conn.clone())
    }

    /// Whether `try_acquire(mode)` would currently find something
    pub fn has_candidate(&self, mode: LeaseMode) -> bool {
        self.connections.lock().iter().any(|conn| {
            let state = conn.state.lock();
            !state.retired
                && !state.exclusive
                && (mode == LeaseMode::Shared || state.leases == 0)
        })
    }

    /// Add a freshly established connection with one lease already taken
    pub fn insert_acquired(&self, conn: Arc<PooledConnection>, mode: LeaseMode) {
        let mut connections = self.connections.lock();
        {
            let mut state = conn.state.lock();
            state.leases = 1;
            state.exclusive = mode == LeaseMode::Exclusive;
            state.last_activity = Instant::now();
        }
        connections.push(conn);
    }

    /// Drop one lease. Returns the connection if it must now be closed.
    pub fn release(&self, conn: &Arc<PooledConnection>, mode: LeaseMode) -> Option<Arc<PooledConnection>> {
        let _connections = self.connections.lock();
        let mut state = conn.state.lock();
        state.leases = state.leases.saturating_sub(1);
        if mode == LeaseMode::Exclusive {
            state.exclusive = false;
        }
        state.last_activity = Instant::now();

        if state.retired && state.leases == 0 && !conn.is_closed() {
            conn.mark_closed(&state);
            return Some(conn.clone());
        }
        None
    }

    /// Give back a lease taken by `try_acquire` and evict the connection
    /// (failed liveness check). Returns it if it can be closed right away.
    pub fn evict_acquired(&self, conn: &Arc<PooledConnection>, mode: LeaseMode) -> Option<Arc<PooledConnection>> {
        let mut connections = self.connections.lock();
        connections.retain(|c| !Arc::ptr_eq(c, conn));

        let mut state = conn.state.lock();
        state.leases = state.leases.saturating_sub(1);
        if mode == LeaseMode::Exclusive {
            state.exclusive = false;
        }
        state.retired = true;
        if state.leases == 0 && !conn.is_closed() {
            conn.mark_closed(&state);
            return Some(conn.clone());
        }
        None
    }

    /// Remove and return unreferenced connections idle longer than `idle_timeout`
    pub fn take_idle(&self, idle_timeout: Duration) -> Vec<Arc<PooledConnection>> {
        let mut connections = self.connections.lock();
        let mut evicted = Vec::new();

        connections.retain(|conn| {
            let mut state = conn.state.lock();
            if state.leases == 0 && state.last_activity.elapsed() >= idle_timeout {
                state.retired = true;
                conn.mark_closed(&state);
                evicted.push(conn.clone());
                false
            } else {
                true
            }
        });

        evicted
    }

    /// Retire every connection. Unreferenced ones are returned for closing now;
    /// leased ones close on their final release.
    pub fn retire_all(&self) -> Vec<Arc<PooledConnection>> {
        let mut connections = self.connections.lock();
        let mut closable = Vec::new();

        for conn in connections.drain(..) {
            let mut state = conn.state.lock();
            state.retired = true;
            if state.leases == 0 && !conn.is_closed() {
                conn.mark_closed(&state);
                closable.push(conn.clone());
            }
        }

        closable
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<PooledConnection>> {
        self.connections.lock().clone()
    }
}
