//! Connection block-list
//!
//! Denies service by remote network (static CIDR ranges from the environment)
//! or by connection id / address blocked at runtime by an administrator.

use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::RwLock;

/// External record of connections/addresses denied service
#[async_trait]
pub trait BlockList: Send + Sync {
    /// Returns the block reason if the connection or its address is blocked
    async fn check(&self, connection_id: &str, addr: Option<IpAddr>) -> Option<String>;

    /// Record a runtime block for a connection (and its address, if known)
    async fn block(&self, connection_id: &str, addr: Option<IpAddr>, reason: &str);

    /// Remove a runtime block. Returns true if an entry existed.
    async fn unblock(&self, connection_id: &str) -> bool;
}

/// Block-list configuration
#[derive(Debug, Clone, Default)]
pub struct BlockListConfig {
    pub networks: Vec<IpNet>,
}

impl BlockListConfig {
    /// Load config from environment variables
    ///
    /// `BLOCKED_NETWORKS` is a comma-separated list of CIDR ranges or single IPs.
    pub fn from_env() -> Self {
        let networks = std::env::var("BLOCKED_NETWORKS")
            .map(|v| parse_networks(&v))
            .unwrap_or_default();

        tracing::info!(blocked_networks = networks.len(), "Block-list config loaded");

        Self { networks }
    }
}

/// Parse a comma-separated list of networks, skipping invalid entries
fn parse_networks(value: &str) -> Vec<IpNet> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let parsed = entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from));
            if parsed.is_err() {
                tracing::warn!("Ignoring invalid blocked network: {}", entry);
            }
            parsed.ok()
        })
        .collect()
}

#[derive(Debug, Clone)]
struct BlockEntry {
    addr: Option<IpAddr>,
    reason: String,
}

/// In-memory block-list: static networks plus runtime entries
#[derive(Debug, Default)]
pub struct StaticBlockList {
    networks: Vec<IpNet>,
    entries: RwLock<HashMap<String, BlockEntry>>,
}

impl StaticBlockList {
    pub fn new(config: &BlockListConfig) -> Self {
        Self {
            networks: config.networks.clone(),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BlockList for StaticBlockList {
    async fn check(&self, connection_id: &str, addr: Option<IpAddr>) -> Option<String> {
        if let Some(addr) = addr {
            if self.networks.iter().any(|net| net.contains(&addr)) {
                return Some("Address is blocked".to_string());
            }
        }

        let entries = self.entries.read().await;
        if let Some(entry) = entries.get(connection_id) {
            return Some(entry.reason.clone());
        }
        addr.and_then(|addr| {
            entries
                .values()
                .find(|entry| entry.addr == Some(addr))
                .map(|entry| entry.reason.clone())
        })
    }

    async fn block(&self, connection_id: &str, addr: Option<IpAddr>, reason: &str) {
        self.entries.write().await.insert(
            connection_id.to_string(),
            BlockEntry {
                addr,
                reason: reason.to_string(),
            },
        );
    }

    async fn unblock(&self, connection_id: &str) -> bool {
        self.entries.write().await.remove(connection_id).is_some()
    }
}
