//! Entity-change notifications feeding the replication layer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOpKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Mission,
    Uav,
    Cluster,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mission => "mission",
            Self::Uav => "uav",
            Self::Cluster => "cluster",
        }
    }
}

/// A local mutation that must be replicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityChange {
    pub op: SyncOpKind,
    pub entity: EntityKind,
    pub entity_id: String,
}

/// A versioned replicated mutation over missions, UAVs, or clusters.
///
/// `version` is a per-entity monotonically increasing counter used for
/// last-writer-wins conflict resolution; `origin` identifies the node that
/// produced the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub op: SyncOpKind,
    pub entity: EntityKind,
    pub entity_id: String,
    pub payload: serde_json::Value,
    /// Unix seconds at the origin.
    pub timestamp: u64,
    pub version: u64,
    pub origin: String,
}
