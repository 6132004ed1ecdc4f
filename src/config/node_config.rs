//! Node configuration: every tunable the control plane recognises.
//!
//! Loaded from TOML with per-section defaults; any absent section or field
//! falls back to the documented default so a minimal config only needs
//! `[node] id = "..."`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub cluster: ClusterSection,
    pub raft: RaftSection,
    pub rpc: RpcSection,
    pub broadcast: BroadcastSection,
    pub fleet: FleetSection,
    pub scheduler: SchedulerSection,
    pub sync: SyncSection,
    pub coordinator: CoordinatorSection,
    pub autoscale: AutoscaleSection,
    pub alerting: AlertingSection,
    pub storage: StorageSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            cluster: ClusterSection::default(),
            raft: RaftSection::default(),
            rpc: RpcSection::default(),
            broadcast: BroadcastSection::default(),
            fleet: FleetSection::default(),
            scheduler: SchedulerSection::default(),
            sync: SyncSection::default(),
            coordinator: CoordinatorSection::default(),
            autoscale: AutoscaleSection::default(),
            alerting: AlertingSection::default(),
            storage: StorageSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Unique node identifier. Required for multi-node deployments.
    pub id: String,
    pub bind_addr: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: "node-1".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// A statically configured peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub node_id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// One of "static", "consul", "etcd".
    pub discovery: String,
    pub peers: Vec<PeerEntry>,
    pub consul_addr: String,
    pub etcd_addr: String,
    pub service_name: String,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            discovery: "static".to_string(),
            peers: Vec::new(),
            consul_addr: "http://127.0.0.1:8500".to_string(),
            etcd_addr: "http://127.0.0.1:2379".to_string(),
            service_name: "skymesh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSection {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Log length past which the leader takes a snapshot.
    pub snapshot_threshold: usize,
}

impl Default for RaftSection {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 1500,
            election_timeout_max_ms: 3000,
            heartbeat_interval_ms: 500,
            snapshot_threshold: 1000,
        }
    }
}

impl RaftSection {
    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }
    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSection {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    /// Bound on the per-peer client cache.
    pub pool_size: usize,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            max_attempts: 3,
            backoff_base_ms: 200,
            backoff_multiplier: 2.0,
            pool_size: 8,
        }
    }
}

impl RpcSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSection {
    pub max_queue_size: usize,
    pub max_connections: usize,
    pub heartbeat_interval_secs: u64,
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_connections: 100,
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSection {
    pub offline_threshold_secs: u64,
    pub liveness_scan_interval_secs: u64,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            offline_threshold_secs: 60,
            liveness_scan_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub dispatch_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub incremental_interval_secs: u64,
    pub full_interval_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            incremental_interval_secs: 30,
            full_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub min_separation_m: f64,
    pub conflict_check_interval_secs: u64,
    pub avoidance_radius_m: f64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            min_separation_m: 50.0,
            conflict_check_interval_secs: 2,
            avoidance_radius_m: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleSection {
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
}

impl Default for AutoscaleSection {
    fn default() -> Self {
        Self {
            min_nodes: 1,
            max_nodes: 10,
            scale_up_threshold: 80.0,
            scale_down_threshold: 50.0,
            scale_up_cooldown_secs: 300,
            scale_down_cooldown_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingSection {
    pub check_interval_secs: u64,
}

impl Default for AlertingSection {
    fn default() -> Self {
        Self {
            check_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub data_dir: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load configuration.
    ///
    /// Order: `SKYMESH_CONFIG` env path, then `skymesh.toml` in the working
    /// directory, then built-in defaults.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("SKYMESH_CONFIG") {
            if let Some(cfg) = Self::from_file(&path) {
                info!(path = %path, "Loaded config from SKYMESH_CONFIG");
                return cfg;
            }
            warn!(path = %path, "SKYMESH_CONFIG set but unreadable, falling back");
        }
        if let Some(cfg) = Self::from_file("skymesh.toml") {
            info!("Loaded config from ./skymesh.toml");
            return cfg;
        }
        info!("Using built-in default configuration");
        Self::default()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        match toml::from_str::<Self>(&contents) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!(error = %e, "Failed to parse config file");
                None
            }
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), String> {
        if self.node.id.trim().is_empty() {
            return Err("node.id must not be empty".into());
        }
        if self.raft.election_timeout_min_ms >= self.raft.election_timeout_max_ms {
            return Err(format!(
                "raft election timeout window inverted: [{}, {}] ms",
                self.raft.election_timeout_min_ms, self.raft.election_timeout_max_ms
            ));
        }
        if self.raft.heartbeat_interval_ms >= self.raft.election_timeout_min_ms {
            return Err("raft heartbeat interval must be below the election timeout".into());
        }
        if self.autoscale.min_nodes > self.autoscale.max_nodes {
            return Err(format!(
                "autoscale bounds inverted: [{}, {}]",
                self.autoscale.min_nodes, self.autoscale.max_nodes
            ));
        }
        if self.autoscale.scale_down_threshold >= self.autoscale.scale_up_threshold {
            return Err("autoscale scale_down_threshold must be below scale_up_threshold".into());
        }
        if self.broadcast.max_queue_size == 0 || self.broadcast.max_connections == 0 {
            return Err("broadcast queue and connection caps must be positive".into());
        }
        if self.rpc.max_attempts == 0 {
            return Err("rpc.max_attempts must be at least 1".into());
        }
        Ok(())
    }
}
