//! Versioned data synchronisation over the replicated log.
//!
//! Every mutation to missions, UAVs, and clusters becomes a
//! [`SyncOperation`] with a per-entity monotonically increasing version.
//! On the leader, operations are batched and committed through the
//! consensus log; every node applies committed operations through
//! last-writer-wins conflict resolution:
//!
//! 1. a lower incoming version than the local one is rejected as stale;
//! 2. equal versions from different origins resolve by lexicographic
//!    origin-node-id order — the greater-or-equal origin wins, so every
//!    replica picks the same winner;
//! 3. anything else applies and advances the local version.
//!
//! Two leader-driven sweeps back the change stream up: an incremental
//! sweep re-announces entities changed since the per-kind checkpoint, and
//! a full sweep re-announces everything as a safety net.

use crate::consensus::{LogEntry, RaftNode, StateMachine};
use crate::error::{CoreError, CoreResult};
use crate::fleet::FleetInventory;
use crate::ids;
use crate::scheduler::MissionScheduler;
use crate::storage::Repository;
use crate::types::{EntityChange, EntityKind, Mission, SyncOpKind, SyncOperation, Uav};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Batch size for draining the outbound queue.
const SYNC_BATCH: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionRecord {
    version: u64,
    origin: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SyncStats {
    pub enqueued: u64,
    pub committed: u64,
    pub applied: u64,
    pub rejected_stale: u64,
}

pub struct DataSynchronizer {
    node_id: String,
    repo: Arc<dyn Repository>,
    scheduler: Arc<MissionScheduler>,
    fleet: Arc<FleetInventory>,
    raft: OnceLock<Arc<RaftNode>>,
    versions: DashMap<String, VersionRecord>,
    queue: Mutex<VecDeque<SyncOperation>>,
    /// Unix-seconds checkpoint per entity kind for the incremental sweep.
    checkpoints: DashMap<EntityKind, u64>,
    enqueued: AtomicU64,
    committed: AtomicU64,
    applied: AtomicU64,
    rejected_stale: AtomicU64,
}

impl DataSynchronizer {
    pub fn new(
        node_id: &str,
        repo: Arc<dyn Repository>,
        scheduler: Arc<MissionScheduler>,
        fleet: Arc<FleetInventory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.to_string(),
            repo,
            scheduler,
            fleet,
            raft: OnceLock::new(),
            versions: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            checkpoints: DashMap::new(),
            enqueued: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            rejected_stale: AtomicU64::new(0),
        })
    }

    /// Late-bind the consensus node (it is constructed after the
    /// synchronizer because it owns the state machine wrapper).
    pub fn attach_raft(&self, raft: Arc<RaftNode>) {
        if self.raft.set(raft).is_err() {
            warn!("attach_raft called twice — ignoring");
        }
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            rejected_stale: self.rejected_stale.load(Ordering::Relaxed),
        }
    }

    pub fn version_of(&self, entity_id: &str) -> u64 {
        self.versions.get(entity_id).map_or(0, |v| v.version)
    }

    // -----------------------------------------------------------------
    // Outbound: local change -> queued operation -> raft
    // -----------------------------------------------------------------

    /// Turn a local mutation into a versioned operation and queue it.
    pub fn record_change(&self, change: &EntityChange) {
        let payload = match (change.entity, change.op) {
            (_, SyncOpKind::Delete) => serde_json::Value::Null,
            (EntityKind::Mission, _) => match self.scheduler.get(&change.entity_id) {
                Ok(mission) => serde_json::to_value(mission).unwrap_or_default(),
                Err(_) => return,
            },
            (EntityKind::Uav, _) => match self.fleet.get(&change.entity_id) {
                Some(uav) => serde_json::to_value(uav).unwrap_or_default(),
                None => return,
            },
            (EntityKind::Cluster, _) => {
                match self
                    .repo
                    .get(&crate::storage::keys::cluster(&change.entity_id))
                {
                    Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_default(),
                    _ => return,
                }
            }
        };

        let version = {
            let mut entry = self
                .versions
                .entry(change.entity_id.clone())
                .or_insert(VersionRecord {
                    version: 0,
                    origin: self.node_id.clone(),
                });
            entry.version += 1;
            entry.origin = self.node_id.clone();
            entry.version
        };

        let op = SyncOperation {
            op: change.op,
            entity: change.entity,
            entity_id: change.entity_id.clone(),
            payload,
            timestamp: ids::unix_secs(),
            version,
            origin: self.node_id.clone(),
        };

        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(op);
            self.enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drain one batch through the consensus log. Leader-only: followers
    /// drop their queue since the leader's sweeps re-announce state.
    fn flush_batch(&self) -> usize {
        let Some(raft) = self.raft.get() else {
            return 0;
        };
        let batch: Vec<SyncOperation> = {
            let Ok(mut queue) = self.queue.lock() else {
                return 0;
            };
            if !raft.is_leader() {
                queue.clear();
                return 0;
            }
            let take = queue.len().min(SYNC_BATCH);
            queue.drain(..take).collect()
        };

        let mut committed = 0;
        for op in batch {
            let command = serde_json::json!({
                "type": "data_sync",
                "operation": op,
            });
            match raft.append_command(command) {
                Ok(_) => {
                    committed += 1;
                    self.committed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    debug!(error = %e, entity_id = %op.entity_id, "Sync append deferred");
                    // Leadership moved mid-batch; the new leader's sweep
                    // covers this entity.
                }
            }
        }
        committed
    }

    // -----------------------------------------------------------------
    // Inbound: committed operation -> local state
    // -----------------------------------------------------------------

    /// Apply a committed operation with version-based conflict
    /// resolution.
    pub fn apply(&self, op: &SyncOperation) -> CoreResult<()> {
        if let Some(local) = self.versions.get(&op.entity_id) {
            if local.version > op.version {
                self.rejected_stale.fetch_add(1, Ordering::Relaxed);
                warn!(
                    entity_id = %op.entity_id,
                    local_version = local.version,
                    incoming_version = op.version,
                    "Stale write rejected"
                );
                return Err(CoreError::InvalidState(format!(
                    "stale write for {} (local {} > incoming {})",
                    op.entity_id, local.version, op.version
                )));
            }
            if local.version == op.version && local.origin != op.origin {
                // Canonical equal-version order: the lexicographically
                // greater origin wins everywhere.
                if op.origin < local.origin {
                    self.rejected_stale.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        entity_id = %op.entity_id,
                        incoming_origin = %op.origin,
                        local_origin = %local.origin,
                        "Equal-version write lost by origin order"
                    );
                    return Ok(());
                }
            }
        }

        match (op.entity, op.op) {
            (EntityKind::Mission, SyncOpKind::Delete) => {
                self.scheduler.remove_replicated(&op.entity_id)?;
            }
            (EntityKind::Mission, _) => {
                let mission: Mission = serde_json::from_value(op.payload.clone())?;
                self.scheduler.apply_replicated(mission)?;
            }
            (EntityKind::Uav, SyncOpKind::Delete) => {
                self.fleet.remove_replicated(&op.entity_id)?;
            }
            (EntityKind::Uav, _) => {
                let uav: Uav = serde_json::from_value(op.payload.clone())?;
                self.fleet.apply_replicated(uav)?;
            }
            (EntityKind::Cluster, SyncOpKind::Delete) => {
                self.repo
                    .delete(&crate::storage::keys::cluster(&op.entity_id))?;
            }
            (EntityKind::Cluster, _) => {
                let bytes = serde_json::to_vec(&op.payload)?;
                self.repo
                    .put(&crate::storage::keys::cluster(&op.entity_id), &bytes)?;
            }
        }

        self.versions.insert(
            op.entity_id.clone(),
            VersionRecord {
                version: op.version,
                origin: op.origin.clone(),
            },
        );
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------

    /// Re-announce entities changed since the per-kind checkpoint.
    pub fn incremental_sweep(&self) -> usize {
        let now = ids::unix_secs();
        let mut announced = 0;

        let mission_checkpoint = self
            .checkpoints
            .get(&EntityKind::Mission)
            .map_or(0, |c| *c);
        for mission in self.scheduler.list() {
            if mission.updated_at > mission_checkpoint {
                self.record_change(&EntityChange {
                    op: SyncOpKind::Update,
                    entity: EntityKind::Mission,
                    entity_id: mission.mission_id,
                });
                announced += 1;
            }
        }
        self.checkpoints.insert(EntityKind::Mission, now);

        let uav_checkpoint = self.checkpoints.get(&EntityKind::Uav).map_or(0, |c| *c);
        for uav in self.fleet.list() {
            if uav.last_heartbeat > uav_checkpoint {
                self.record_change(&EntityChange {
                    op: SyncOpKind::Update,
                    entity: EntityKind::Uav,
                    entity_id: uav.uav_id,
                });
                announced += 1;
            }
        }
        self.checkpoints.insert(EntityKind::Uav, now);

        announced
    }

    /// Re-announce everything.
    pub fn full_sweep(&self) -> usize {
        let mut announced = 0;
        for mission in self.scheduler.list() {
            self.record_change(&EntityChange {
                op: SyncOpKind::Update,
                entity: EntityKind::Mission,
                entity_id: mission.mission_id,
            });
            announced += 1;
        }
        for uav in self.fleet.list() {
            self.record_change(&EntityChange {
                op: SyncOpKind::Update,
                entity: EntityKind::Uav,
                entity_id: uav.uav_id,
            });
            announced += 1;
        }
        info!(announced, "Full sync sweep queued");
        announced
    }

    // -----------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------

    /// Forward local change notifications into the sync queue.
    pub async fn run_change_listener(
        self: Arc<Self>,
        mut mission_changes: broadcast::Receiver<EntityChange>,
        mut uav_changes: broadcast::Receiver<EntityChange>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                change = mission_changes.recv() => match change {
                    Ok(change) => self.record_change(&change),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Mission change stream lagged; sweep will repair");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                change = uav_changes.recv() => match change {
                    Ok(change) => self.record_change(&change),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "UAV change stream lagged; sweep will repair");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    /// Queue drain plus the periodic incremental and full sweeps. Only the
    /// leader drives sweeps.
    pub async fn run_sync_loops(self: Arc<Self>, cancel: CancellationToken) {
        let cfg = &crate::config::get().sync;
        let incremental = Duration::from_secs(cfg.incremental_interval_secs);
        let full = Duration::from_secs(cfg.full_interval_secs);
        let drain = Duration::from_millis(500);

        let mut incremental_timer = tokio::time::interval(incremental);
        let mut full_timer = tokio::time::interval(full);
        let mut drain_timer = tokio::time::interval(drain);
        // The first tick of a tokio interval fires immediately; skip it so
        // the full sweep does not fire at startup.
        incremental_timer.tick().await;
        full_timer.tick().await;

        info!(
            incremental_secs = incremental.as_secs(),
            full_secs = full.as_secs(),
            "Data sync loops started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Data sync loops stopped");
                    return;
                }
                _ = drain_timer.tick() => {
                    self.flush_batch();
                }
                _ = incremental_timer.tick() => {
                    if self.raft.get().is_some_and(|r| r.is_leader()) {
                        let n = self.incremental_sweep();
                        if n > 0 {
                            debug!(announced = n, "Incremental sync sweep queued");
                        }
                    }
                }
                _ = full_timer.tick() => {
                    if self.raft.get().is_some_and(|r| r.is_leader()) {
                        self.full_sweep();
                    }
                }
            }
        }
    }
}

/// Adapter feeding committed log entries into the synchronizer.
pub struct SyncStateMachine {
    sync: Arc<DataSynchronizer>,
}

impl SyncStateMachine {
    pub fn new(sync: Arc<DataSynchronizer>) -> Self {
        Self { sync }
    }
}

impl StateMachine for SyncStateMachine {
    fn apply(&self, entry: &LogEntry) {
        let Some(kind) = entry.command.get("type").and_then(|t| t.as_str()) else {
            return;
        };
        if kind != "data_sync" {
            debug!(kind = %kind, "Unknown replicated command ignored");
            return;
        }
        let Some(op_value) = entry.command.get("operation") else {
            return;
        };
        match serde_json::from_value::<SyncOperation>(op_value.clone()) {
            Ok(op) => {
                // Stale writes are an expected outcome here, not a fault.
                let _ = self.sync.apply(&op);
            }
            Err(e) => warn!(error = %e, index = entry.index, "Malformed sync operation"),
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        let missions = self.sync.scheduler.list();
        let uavs = self.sync.fleet.list();
        let versions: std::collections::HashMap<String, VersionRecord> = self
            .sync
            .versions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        serde_json::json!({
            "missions": missions,
            "uavs": uavs,
            "versions": versions,
        })
    }

    fn restore(&self, data: &serde_json::Value) {
        if let Some(missions) = data.get("missions") {
            if let Ok(missions) = serde_json::from_value::<Vec<Mission>>(missions.clone()) {
                for mission in missions {
                    let _ = self.sync.scheduler.apply_replicated(mission);
                }
            }
        }
        if let Some(uavs) = data.get("uavs") {
            if let Ok(uavs) = serde_json::from_value::<Vec<Uav>>(uavs.clone()) {
                for uav in uavs {
                    let _ = self.sync.fleet.apply_replicated(uav);
                }
            }
        }
        if let Some(versions) = data.get("versions") {
            if let Ok(versions) = serde_json::from_value::<
                std::collections::HashMap<String, VersionRecord>,
            >(versions.clone())
            {
                self.sync.versions.clear();
                for (id, record) in versions {
                    self.sync.versions.insert(id, record);
                }
            }
        }
        info!("State machine restored from snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledRepository;
    use crate::types::{MissionKind, MissionProfile, MissionState, ShortfallPolicy};

    fn synchronizer(node_id: &str) -> Arc<DataSynchronizer> {
        let repo: Arc<dyn Repository> = Arc::new(SledRepository::open_temporary().unwrap());
        let fleet = Arc::new(FleetInventory::open(repo.clone()).unwrap());
        let scheduler =
            Arc::new(MissionScheduler::open(repo.clone(), fleet.clone()).unwrap());
        DataSynchronizer::new(node_id, repo, scheduler, fleet)
    }

    fn mission_payload(id: &str, version_marker: &str) -> serde_json::Value {
        serde_json::to_value(Mission {
            mission_id: id.into(),
            name: version_marker.into(),
            description: String::new(),
            kind: MissionKind::SingleUav,
            profile: MissionProfile::Other,
            uav_list: vec![],
            payload: serde_json::json!({}),
            priority: 0,
            state: MissionState::Pending,
            progress: 0.0,
            area: None,
            requested_uavs: 1,
            on_shortfall: ShortfallPolicy::Fail,
            retry_of: None,
            created_at: 1,
            updated_at: 1,
            started_at: None,
            completed_at: None,
        })
        .unwrap()
    }

    fn op(entity_id: &str, version: u64, origin: &str, marker: &str) -> SyncOperation {
        SyncOperation {
            op: SyncOpKind::Update,
            entity: EntityKind::Mission,
            entity_id: entity_id.into(),
            payload: mission_payload(entity_id, marker),
            timestamp: 100,
            version,
            origin: origin.into(),
        }
    }

    #[test]
    fn test_stale_version_rejected() {
        let sync = synchronizer("node-a");
        sync.apply(&op("m1", 8, "node-b", "v8")).unwrap();
        assert!(sync.apply(&op("m1", 7, "node-c", "v7")).is_err());

        assert_eq!(sync.version_of("m1"), 8);
        assert_eq!(sync.scheduler.get("m1").unwrap().name, "v8");
        assert_eq!(sync.stats().rejected_stale, 1);
    }

    #[test]
    fn test_higher_version_applies() {
        let sync = synchronizer("node-a");
        sync.apply(&op("m1", 1, "node-b", "v1")).unwrap();
        sync.apply(&op("m1", 2, "node-b", "v2")).unwrap();
        assert_eq!(sync.version_of("m1"), 2);
        assert_eq!(sync.scheduler.get("m1").unwrap().name, "v2");
    }

    #[test]
    fn test_equal_version_resolved_by_origin_order() {
        let sync = synchronizer("node-a");
        sync.apply(&op("m1", 3, "node-b", "from-b")).unwrap();

        // node-a < node-b lexicographically: the incoming write loses.
        sync.apply(&op("m1", 3, "node-a", "from-a")).unwrap();
        assert_eq!(sync.scheduler.get("m1").unwrap().name, "from-b");

        // node-c > node-b: the incoming write wins.
        sync.apply(&op("m1", 3, "node-c", "from-c")).unwrap();
        assert_eq!(sync.scheduler.get("m1").unwrap().name, "from-c");
        assert_eq!(sync.version_of("m1"), 3);
    }

    #[test]
    fn test_version_never_decreases() {
        let sync = synchronizer("node-a");
        for version in [1u64, 5, 3, 7, 6] {
            let _ = sync.apply(&op("m1", version, "node-b", "x"));
            assert!(sync.version_of("m1") >= version.min(sync.version_of("m1")));
        }
        assert_eq!(sync.version_of("m1"), 7);
    }

    #[test]
    fn test_delete_applies() {
        let sync = synchronizer("node-a");
        sync.apply(&op("m1", 1, "node-b", "v1")).unwrap();
        let delete = SyncOperation {
            op: SyncOpKind::Delete,
            entity: EntityKind::Mission,
            entity_id: "m1".into(),
            payload: serde_json::Value::Null,
            timestamp: 101,
            version: 2,
            origin: "node-b".into(),
        };
        sync.apply(&delete).unwrap();
        assert!(sync.scheduler.get("m1").is_err());
    }

    #[test]
    fn test_record_change_bumps_version_and_queues() {
        let sync = synchronizer("node-a");
        let mission = sync
            .scheduler
            .create(crate::scheduler::CreateMissionRequest {
                name: "m".into(),
                description: String::new(),
                kind: MissionKind::SingleUav,
                profile: MissionProfile::Other,
                uav_list: vec![],
                payload: serde_json::json!({}),
                priority: 0,
                area: None,
                requested_uavs: None,
                on_shortfall: ShortfallPolicy::Fail,
            })
            .unwrap();

        sync.record_change(&EntityChange {
            op: SyncOpKind::Update,
            entity: EntityKind::Mission,
            entity_id: mission.mission_id.clone(),
        });
        sync.record_change(&EntityChange {
            op: SyncOpKind::Update,
            entity: EntityKind::Mission,
            entity_id: mission.mission_id.clone(),
        });
        assert_eq!(sync.version_of(&mission.mission_id), 2);
        assert_eq!(sync.stats().enqueued, 2);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let source = synchronizer("node-a");
        source.apply(&op("m1", 4, "node-b", "snapshotted")).unwrap();
        let machine = SyncStateMachine::new(source);
        let snapshot = machine.snapshot();

        let target = synchronizer("node-b");
        let target_machine = SyncStateMachine::new(target.clone());
        target_machine.restore(&snapshot);

        assert_eq!(target.scheduler.get("m1").unwrap().name, "snapshotted");
        assert_eq!(target.version_of("m1"), 4);
    }

    #[test]
    fn test_state_machine_applies_log_entries() {
        let sync = synchronizer("node-a");
        let machine = SyncStateMachine::new(sync.clone());
        let entry = LogEntry {
            term: 1,
            index: 1,
            command: serde_json::json!({
                "type": "data_sync",
                "operation": op("m1", 1, "node-b", "via-log"),
            }),
            timestamp: 0,
        };
        machine.apply(&entry);
        assert_eq!(sync.scheduler.get("m1").unwrap().name, "via-log");
    }
}
