//! Per-client concurrent channel cap

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

/// Counts open streaming channels per client address
pub struct ClientLimiter {
    max_per_client: usize,
    active: DashMap<IpAddr, usize>,
}

impl ClientLimiter {
    pub fn new(max_per_client: usize) -> Self {
        Self {
            max_per_client,
            active: DashMap::new(),
        }
    }

    /// Reserve a slot for `ip`. `None` when the client is at its cap.
    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Option<ClientPermit> {
        let mut count = self.active.entry(ip).or_insert(0);
        if *count >= self.max_per_client {
            warn!(
                target: "ssh_gateway::audit",
                client = %ip,
                limit = self.max_per_client,
                "too many concurrent channels"
            );
            return None;
        }
        *count += 1;
        drop(count);

        Some(ClientPermit {
            limiter: self.clone(),
            ip,
        })
    }

    pub fn active(&self, ip: IpAddr) -> usize {
        self.active.get(&ip).map(|c| *c).unwrap_or(0)
    }

    fn release(&self, ip: IpAddr) {
        if let Some(mut count) = self.active.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
        self.active.remove_if(&ip, |_, count| *count == 0);
    }
}

/// Held for the lifetime of one channel
pub struct ClientPermit {
    limiter: Arc<ClientLimiter>,
    ip: IpAddr,
}

impl Drop for ClientPermit {
    fn drop(&mut self) {
        self.limiter.release(self.ip);
    }
}
