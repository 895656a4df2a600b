//! Configuration for a store instance.
//!
//! One [`KvStoreConfig`] per node, constructed programmatically or
//! deserialized from the daemon's config file. [`KvStoreConfig::validate`]
//! runs at startup; fatal problems (empty node id, zero TTL decrement)
//! refuse to start rather than limp along.
//!
//! # Quick Start
//!
//! ```rust
//! use kvmesh::config::KvStoreConfig;
//!
//! let config = KvStoreConfig {
//!     node_id: "pod-1.rack-2".into(),
//!     cmd_url: "mem://pod-1.rack-2/cmd".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KvStoreError, Result};

/// Flood rate limit: a token bucket of `burst_size` tokens refilling at
/// `messages_per_sec`. Absence of a [`FloodRate`] disables rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodRate {
    pub messages_per_sec: u32,
    pub burst_size: u32,
}

/// Key-prefix and originator-id allowlists applied to merges and dumps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Keys must start with one of these prefixes. Empty matches all.
    #[serde(default)]
    pub key_prefixes: Vec<String>,

    /// Records must be authored by one of these nodes. Empty matches all.
    #[serde(default)]
    pub originator_ids: Vec<String>,
}

/// Everything a store instance needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStoreConfig {
    /// This node's unique id. Appended to flood trails and stamped as
    /// originator on locally authored records.
    pub node_id: String,

    /// Endpoint the command channel binds to. Peers reach this node here.
    pub cmd_url: String,

    /// Base interval between periodic anti-entropy syncs; each round picks
    /// one random peer. Jittered by ±20%.
    #[serde(default = "default_db_sync_interval_sec")]
    pub db_sync_interval_sec: u64,

    /// How often counters are submitted to the metrics backend.
    #[serde(default = "default_monitor_submit_interval_sec")]
    pub monitor_submit_interval_sec: u64,

    /// Milliseconds subtracted from every key's remaining TTL on each
    /// forwarding hop. Must be at least 1 so TTLs strictly decrease.
    #[serde(default = "default_ttl_decrement_ms")]
    pub ttl_decrement_ms: u64,

    /// Bound on each peer-directed outbound queue. A full queue fails the
    /// send rather than blocking the loop.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,

    /// DSCP marking for transports that support it. The in-memory transport
    /// ignores this.
    #[serde(default)]
    pub ip_tos: Option<u8>,

    /// Outbound flood rate limit. `None` disables rate limiting.
    #[serde(default)]
    pub flood_rate: Option<FloodRate>,

    /// Merge/dump allowlists. `None` admits everything.
    #[serde(default)]
    pub filters: Option<FilterConfig>,

    /// Participate in the spanning-tree computation.
    #[serde(default)]
    pub enable_flood_optimization: bool,

    /// Restrict flooding to the spanning-tree neighborhood. Requires
    /// `enable_flood_optimization`.
    #[serde(default)]
    pub use_flood_optimization: bool,

    /// Advertise this node as a flood root.
    #[serde(default)]
    pub is_flood_root: bool,
}

fn default_db_sync_interval_sec() -> u64 {
    60
}

fn default_monitor_submit_interval_sec() -> u64 {
    30
}

fn default_ttl_decrement_ms() -> u64 {
    1
}

fn default_high_watermark() -> usize {
    65_536
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            cmd_url: String::new(),
            db_sync_interval_sec: default_db_sync_interval_sec(),
            monitor_submit_interval_sec: default_monitor_submit_interval_sec(),
            ttl_decrement_ms: default_ttl_decrement_ms(),
            high_watermark: default_high_watermark(),
            ip_tos: None,
            flood_rate: None,
            filters: None,
            enable_flood_optimization: false,
            use_flood_optimization: false,
            is_flood_root: false,
        }
    }
}

impl KvStoreConfig {
    /// Minimal config for tests: the command URL is derived from the node id
    /// and timers that would otherwise fire mid-test are stretched out.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            cmd_url: format!("mem://{node_id}/cmd"),
            db_sync_interval_sec: 3_600,
            monitor_submit_interval_sec: 3_600,
            ..Default::default()
        }
    }

    /// Reject fatal misconfiguration before the actor starts.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(KvStoreError::Config("node_id must not be empty".into()));
        }
        if self.cmd_url.is_empty() {
            return Err(KvStoreError::Config("cmd_url must not be empty".into()));
        }
        if self.ttl_decrement_ms == 0 {
            return Err(KvStoreError::Config(
                "ttl_decrement_ms must be at least 1".into(),
            ));
        }
        if let Some(rate) = &self.flood_rate {
            if rate.messages_per_sec == 0 || rate.burst_size == 0 {
                return Err(KvStoreError::Config(
                    "flood_rate requires non-zero rate and burst".into(),
                ));
            }
        }
        if self.use_flood_optimization && !self.enable_flood_optimization {
            return Err(KvStoreError::Config(
                "use_flood_optimization requires enable_flood_optimization".into(),
            ));
        }
        Ok(())
    }

    pub fn db_sync_interval(&self) -> Duration {
        Duration::from_secs(self.db_sync_interval_sec)
    }

    pub fn monitor_submit_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_submit_interval_sec)
    }

    pub fn ttl_decrement(&self) -> Duration {
        Duration::from_millis(self.ttl_decrement_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_testing_is_valid() {
        let config = KvStoreConfig::for_testing("node-1");
        assert!(config.validate().is_ok());
        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.cmd_url, "mem://node-1/cmd");
    }

    #[test]
    fn test_empty_node_id_rejected() {
        let config = KvStoreConfig {
            cmd_url: "mem://x/cmd".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_cmd_url_rejected() {
        let config = KvStoreConfig {
            node_id: "node-1".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_ttl_decrement_rejected() {
        let mut config = KvStoreConfig::for_testing("node-1");
        config.ttl_decrement_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_flood_rate_rejected() {
        let mut config = KvStoreConfig::for_testing("node-1");
        config.flood_rate = Some(FloodRate {
            messages_per_sec: 0,
            burst_size: 10,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_use_without_enable_rejected() {
        let mut config = KvStoreConfig::for_testing("node-1");
        config.use_flood_optimization = true;
        assert!(config.validate().is_err());

        config.enable_flood_optimization = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{"node_id": "n1", "cmd_url": "mem://n1/cmd"}"#;
        let config: KvStoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.db_sync_interval_sec, 60);
        assert_eq!(config.ttl_decrement_ms, 1);
        assert!(config.flood_rate.is_none());
        assert!(!config.is_flood_root);
    }
}
