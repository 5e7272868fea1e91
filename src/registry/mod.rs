//! Connection Registry
//!
//! Owns every live remote session, keyed by [`ConnectionKey`]. Callers never
//! hold a connection directly, only a [`Lease`] on one.
//!
//! ```text
//!   lease(key, mode) ──► reuse healthy pooled connection ──► Lease
//!          │                      │ liveness check fails
//!          │                      ▼
//!          └──────────────► evict + connect fresh ─────────► Lease
//!
//!   drop(Lease) ──► release: lease count - 1, touch idle timer
//!   idle sweep  ──► close unreferenced connections idle > threshold
//! ```
//!
//! # Invariants
//! - A pooled connection is only closed with zero leases
//! - At most one exclusive lease per connection, and never alongside shared ones
//! - A failed handshake never leaves an entry behind

mod lease;
mod pool;

pub use lease::{Lease, LeaseMode, OperationGuard};
pub use pool::PooledConnection;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::policy::{AllowAll, LeasePolicy, PolicyDecision};
use crate::ssh::{ConnectionKey, RemoteConnector};
use pool::KeyPool;

/// Registry tuning
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Unreferenced connections idle this long are closed by the sweep
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Introspection row for one pooled connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: u64,
    /// `user@host:port`
    pub endpoint: String,
    pub leases: usize,
    pub exclusive: bool,
    pub idle_secs: u64,
    pub uptime_secs: u64,
}

/// Pool of live remote sessions
pub struct ConnectionRegistry {
    connector: Arc<dyn RemoteConnector>,
    policy: Arc<dyn LeasePolicy>,
    config: RegistryConfig,
    pools: DashMap<ConnectionKey, Arc<KeyPool>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn RemoteConnector>, config: RegistryConfig) -> Self {
        Self::with_policy(connector, Arc::new(AllowAll), config)
    }

    pub fn with_policy(
        connector: Arc<dyn RemoteConnector>,
        policy: Arc<dyn LeasePolicy>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            connector,
            policy,
            config,
            pools: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Lease a connection for `key`
    pub async fn lease(&self, key: &ConnectionKey, mode: LeaseMode) -> Result<Lease, GatewayError> {
        self.lease_for_client(key, mode, None).await
    }

    /// Lease a connection on behalf of a known client address
    pub async fn lease_for_client(
        &self,
        key: &ConnectionKey,
        mode: LeaseMode,
        client: Option<IpAddr>,
    ) -> Result<Lease, GatewayError> {
        if let PolicyDecision::Deny(reason) = self.policy.check(key, client).await {
            return Err(GatewayError::PolicyDenied(reason));
        }

        let pool = self.pool_for(key);

        loop {
            if let Some(conn) = pool.try_acquire(mode) {
                if self.check_alive(&conn).await {
                    debug!(
                        "Reusing connection #{} for {} ({})",
                        conn.id(),
                        key.endpoint(),
                        mode
                    );
                    return Ok(Lease::new(conn, pool, mode));
                }

                warn!(
                    "Pooled connection #{} to {} failed liveness check, evicting",
                    conn.id(),
                    key.endpoint()
                );
                if let Some(dead) = pool.evict_acquired(&conn, mode) {
                    dead.close_transport().await;
                }
                continue;
            }

            let _connecting = pool.connecting.lock().await;
            if pool.has_candidate(mode) {
                // Established by another caller while we waited
                continue;
            }

            let transport = self.connector.connect(key).await?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let conn = Arc::new(PooledConnection::new(id, key.clone(), transport));
            pool.insert_acquired(conn.clone(), mode);

            info!(
                "Pooled new connection #{} for {} ({})",
                id,
                key.endpoint(),
                mode
            );
            // `_connecting` still borrows the pool
            return Ok(Lease::new(conn, pool.clone(), mode));
        }
    }

    /// Explicit disconnect. Unreferenced connections for `key` close now,
    /// leased ones close when their last lease is released.
    ///
    /// Returns the number of pooled connections removed.
    pub async fn disconnect(&self, key: &ConnectionKey) -> usize {
        let Some(pool) = self.pools.get(key).map(|p| p.value().clone()) else {
            return 0;
        };

        let removed = pool.snapshot().len();
        for conn in pool.retire_all() {
            conn.close_transport().await;
        }
        drop(pool);
        self.prune_empty();

        if removed > 0 {
            info!("Disconnected {} connection(s) for {}", removed, key.endpoint());
        }
        removed
    }

    /// Close every unreferenced connection idle past the threshold.
    ///
    /// Returns how many were closed.
    pub async fn sweep_idle(&self) -> usize {
        let mut evicted = Vec::new();
        for entry in self.pools.iter() {
            evicted.extend(entry.value().take_idle(self.config.idle_timeout));
        }
        self.prune_empty();

        for conn in &evicted {
            info!(
                "Idle eviction of connection #{} ({})",
                conn.id(),
                conn.key().endpoint()
            );
            conn.close_transport().await;
        }
        evicted.len()
    }

    /// Start the periodic idle sweep
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let closed = registry.sweep_idle().await;
                if closed > 0 {
                    debug!("Idle sweep closed {} connection(s)", closed);
                }
            }
            debug!("Idle sweeper stopped");
        })
    }

    /// Active connections with their lease counts. No side effects.
    pub fn list_active(&self) -> Vec<ConnectionSummary> {
        let mut rows: Vec<ConnectionSummary> = self
            .pools
            .iter()
            .flat_map(|entry| entry.value().snapshot())
            .map(|conn| {
                let state = conn.state.lock();
                ConnectionSummary {
                    id: conn.id(),
                    endpoint: conn.key().endpoint(),
                    leases: state.leases,
                    exclusive: state.exclusive,
                    idle_secs: state.last_activity.elapsed().as_secs(),
                    uptime_secs: conn.created_at().elapsed().as_secs(),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.endpoint.cmp(&b.endpoint).then(a.id.cmp(&b.id)));
        rows
    }

    /// Number of pooled connections
    pub fn count(&self) -> usize {
        self.pools.iter().map(|entry| entry.value().snapshot().len()).sum()
    }

    /// Close everything (process stop). Leased connections close on release.
    pub async fn shutdown(&self) {
        let pools: Vec<Arc<KeyPool>> = self.pools.iter().map(|e| e.value().clone()).collect();
        let mut closed = 0;
        for pool in pools {
            for conn in pool.retire_all() {
                conn.close_transport().await;
                closed += 1;
            }
        }
        self.prune_empty();
        info!("Connection registry shut down ({} closed)", closed);
    }

    fn pool_for(&self, key: &ConnectionKey) -> Arc<KeyPool> {
        self.pools
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyPool::default()))
            .value()
            .clone()
    }

    /// Drop per-key pools nobody holds and that own no connections
    fn prune_empty(&self) {
        self.pools
            .retain(|_, pool| !(Arc::strong_count(pool) == 1 && pool.is_empty()));
    }

    /// Liveness round trip, serialized with other operations when required
    async fn check_alive(&self, conn: &Arc<PooledConnection>) -> bool {
        let transport = conn.transport();
        if transport.is_multiplexed() {
            transport.is_alive().await
        } else {
            let _permit = conn.op_lock.lock().await;
            transport.is_alive().await
        }
    }
}
