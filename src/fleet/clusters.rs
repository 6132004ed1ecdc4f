//! Named UAV clusters with member roles.
//!
//! A cluster is an operator-defined grouping of vehicles used to scope
//! cluster missions. The first member of a new cluster takes the LEADER
//! role; later members join as WORKERs unless told otherwise.

use crate::error::{CoreError, CoreResult};
use crate::ids::{self, IdGen};
use crate::storage::{keys, Repository, RepositoryExt};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterRole {
    Leader,
    Coordinator,
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    pub uav_id: String,
    pub role: ClusterRole,
    pub joined_at: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub members: Vec<ClusterMember>,
    pub created_at: u64,
    pub updated_at: u64,
}

pub struct ClusterRegistry {
    repo: Arc<dyn Repository>,
    clusters: DashMap<String, ClusterInfo>,
    idgen: IdGen,
}

impl ClusterRegistry {
    pub fn open(repo: Arc<dyn Repository>) -> CoreResult<Self> {
        // The `cluster/` keyspace also holds cluster missions; registry
        // entries are scoped under their own id prefix.
        let clusters = DashMap::new();
        for (_, cluster) in repo.scan_json::<ClusterInfo>("cluster/grp_")? {
            clusters.insert(cluster.cluster_id.clone(), cluster);
        }
        Ok(Self {
            repo,
            clusters,
            idgen: IdGen::new(),
        })
    }

    pub fn create(
        &self,
        name: &str,
        description: &str,
        initial_members: &[String],
    ) -> CoreResult<ClusterInfo> {
        if name.trim().is_empty() {
            return Err(CoreError::Validation("cluster name cannot be empty".into()));
        }
        let now = ids::unix_secs();
        let members = initial_members
            .iter()
            .enumerate()
            .map(|(i, uav_id)| ClusterMember {
                uav_id: uav_id.clone(),
                role: if i == 0 {
                    ClusterRole::Leader
                } else {
                    ClusterRole::Worker
                },
                joined_at: now,
                metadata: serde_json::json!({}),
            })
            .collect();

        let cluster = ClusterInfo {
            cluster_id: self.idgen.next("grp"),
            name: name.to_string(),
            description: description.to_string(),
            members,
            created_at: now,
            updated_at: now,
        };

        self.repo
            .put_json(&keys::cluster(&cluster.cluster_id), &cluster)?;
        self.clusters
            .insert(cluster.cluster_id.clone(), cluster.clone());
        info!(
            cluster_id = %cluster.cluster_id,
            members = cluster.members.len(),
            "Cluster created"
        );
        Ok(cluster)
    }

    pub fn add_member(
        &self,
        cluster_id: &str,
        uav_id: &str,
        role: ClusterRole,
    ) -> CoreResult<ClusterInfo> {
        let mut entry = self
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| CoreError::NotFound(format!("cluster {cluster_id}")))?;

        if entry.members.iter().any(|m| m.uav_id == uav_id) {
            return Err(CoreError::InvalidState(format!(
                "uav {uav_id} already in cluster {cluster_id}"
            )));
        }
        entry.members.push(ClusterMember {
            uav_id: uav_id.to_string(),
            role,
            joined_at: ids::unix_secs(),
            metadata: serde_json::json!({}),
        });
        entry.updated_at = ids::unix_secs();
        let snapshot = entry.clone();
        drop(entry);
        self.repo
            .put_json(&keys::cluster(&snapshot.cluster_id), &snapshot)?;
        Ok(snapshot)
    }

    pub fn get(&self, cluster_id: &str) -> Option<ClusterInfo> {
        self.clusters.get(cluster_id).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<ClusterInfo> {
        let mut all: Vec<ClusterInfo> = self.clusters.iter().map(|e| e.clone()).collect();
        all.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        all
    }
}
