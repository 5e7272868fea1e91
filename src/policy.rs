//! Lease policy hook
//!
//! The registry asks a [`LeasePolicy`] before granting any lease. The gateway
//! treats the policy as a black box; threat heuristics live elsewhere and plug
//! in through this trait.

use std::collections::HashSet;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::warn;

use crate::ssh::ConnectionKey;

/// Outcome of a policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

#[async_trait]
pub trait LeasePolicy: Send + Sync {
    async fn check(&self, key: &ConnectionKey, client: Option<IpAddr>) -> PolicyDecision;
}

/// Permits everything
pub struct AllowAll;

#[async_trait]
impl LeasePolicy for AllowAll {
    async fn check(&self, _key: &ConnectionKey, _client: Option<IpAddr>) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Static deny list of target hosts and client addresses
#[derive(Debug, Default)]
pub struct DenyList {
    hosts: HashSet<String>,
    clients: HashSet<IpAddr>,
}

impl DenyList {
    pub fn new(hosts: impl IntoIterator<Item = String>, clients: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            hosts: hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect(),
            clients: clients.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.clients.is_empty()
    }
}

#[async_trait]
impl LeasePolicy for DenyList {
    async fn check(&self, key: &ConnectionKey, client: Option<IpAddr>) -> PolicyDecision {
        if let Some(ip) = client {
            if self.clients.contains(&ip) {
                warn!(target: "ssh_gateway::audit", client = %ip, "client is deny-listed");
                return PolicyDecision::Deny(format!("client {} is not allowed", ip));
            }
        }
        if self.hosts.contains(&key.host().to_ascii_lowercase()) {
            warn!(target: "ssh_gateway::audit", endpoint = %key.endpoint(), "target host is deny-listed");
            return PolicyDecision::Deny(format!("host {} is not allowed", key.host()));
        }
        PolicyDecision::Allow
    }
}
