//! YAML-backed node configuration (`spec.md` §6).

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub port: u16,
    pub node_id: String,
    /// Static next hop this node forwards accepted custody offers to. No
    /// topology discovery: a node only relays when this is configured.
    pub relay_next_hop: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            port: 7777,
            node_id: "courier-node".to_string(),
            relay_next_hop: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub window_size: usize,
    pub base_rto_ms: u64,
    pub max_rto_ms: u64,
    pub ttl_sec: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk_size: 1150,
            window_size: 64,
            base_rto_ms: 50,
            max_rto_ms: 5000,
            ttl_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    pub enabled: bool,
    pub k: usize,
    pub r: usize,
}

impl Default for FecConfig {
    fn default() -> Self {
        FecConfig {
            enabled: false,
            k: 4,
            r: 2,
        }
    }
}

/// Custody release policy — resolves the Open Question in `spec.md` §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Release local copies as soon as a covering CUSTODY_ACK arrives.
    Eager,
    /// Defer release until the downstream release cascade (DELIVERED) is observed.
    Deferred,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        ReleasePolicy::Eager
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodyConfig {
    pub max_retries: u32,
    pub backoff_base_sec: u64,
    pub backoff_cap_sec: u64,
    pub release_policy: ReleasePolicy,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        CustodyConfig {
            max_retries: 10,
            backoff_base_sec: 2,
            backoff_cap_sec: 64,
            release_policy: ReleasePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cap_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            cap_bytes: 10 * 1024 * 1024 * 1024, // 10 GiB
        }
    }
}

/// Top-level node configuration, loaded from an optional YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub node: NodeConfig,
    pub transfer: TransferConfig,
    pub fec: FecConfig,
    pub custody: CustodyConfig,
    pub storage: StorageConfig,
}

impl CourierConfig {
    /// Load configuration from a YAML file. Missing keys fall back to
    /// their documented defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: CourierConfig = serde_yaml::from_str(&text)?;
        Ok(config)
    }
}
