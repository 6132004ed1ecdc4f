//! Mission scheduler — lifecycle state machine, admission, priority
//! dispatch, retry.
//!
//! The mission table is a derived view over the `mission/` keyspace; every
//! mutation writes through and is announced on the change stream for
//! replication. Lifecycle transitions follow the directed edge set in
//! [`crate::types::MissionState::can_transition`]; anything else fails
//! with `INVALID_STATE`.
//!
//! Multi-table invariants (dispatch flipping vehicles BUSY) touch the UAV
//! table first and the mission table second, always in that order.

pub mod retry;

pub use retry::{ErrorClass, RetryManager, RetryPolicy};

use crate::error::{CoreError, CoreResult};
use crate::fleet::FleetInventory;
use crate::ids::{self, IdGen};
use crate::planner::assigner::{self, AssignStrategy, Candidate};
use crate::planner::splitter::{self, SplitMethod, UavPlanInfo};
use crate::storage::{keys, Repository, RepositoryExt};
use crate::types::{
    Area, ClusterMission, ClusterMissionKind, EntityChange, EntityKind, Mission, MissionEvent,
    MissionEventKind, MissionKind, MissionProfile, MissionState, ShortfallPolicy,
    SubMissionAssignment, SyncOpKind,
};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cap on the in-memory mission event journal.
const EVENT_JOURNAL_CAP: usize = 1000;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateMissionRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: MissionKind,
    #[serde(default)]
    pub profile: MissionProfile,
    #[serde(default)]
    pub uav_list: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub area: Option<Area>,
    #[serde(default)]
    pub requested_uavs: Option<usize>,
    #[serde(default)]
    pub on_shortfall: ShortfallPolicy,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateClusterMissionRequest {
    pub name: String,
    pub kind: ClusterMissionKind,
    pub area: Area,
    pub uav_count: usize,
    #[serde(default)]
    pub profile: MissionProfile,
    #[serde(default = "default_split_method")]
    pub split_method: SplitMethod,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub on_shortfall: ShortfallPolicy,
}

fn default_split_method() -> SplitMethod {
    SplitMethod::CapabilityWeighted
}

pub struct MissionScheduler {
    repo: Arc<dyn Repository>,
    fleet: Arc<FleetInventory>,
    missions: DashMap<String, Mission>,
    retry: Arc<RetryManager>,
    idgen: IdGen,
    journal: Mutex<VecDeque<MissionEvent>>,
    events: broadcast::Sender<MissionEvent>,
    changes: broadcast::Sender<EntityChange>,
}

impl MissionScheduler {
    pub fn open(repo: Arc<dyn Repository>, fleet: Arc<FleetInventory>) -> CoreResult<Self> {
        let missions = DashMap::new();
        for (_, mission) in repo.scan_json::<Mission>("mission/")? {
            missions.insert(mission.mission_id.clone(), mission);
        }
        if !missions.is_empty() {
            info!(count = missions.len(), "Mission table restored from store");
        }
        let (events, _) = broadcast::channel(256);
        let (changes, _) = broadcast::channel(256);
        Ok(Self {
            repo,
            fleet,
            missions,
            retry: Arc::new(RetryManager::new()),
            idgen: IdGen::new(),
            journal: Mutex::new(VecDeque::with_capacity(EVENT_JOURNAL_CAP)),
            events,
            changes,
        })
    }

    pub fn retry_manager(&self) -> Arc<RetryManager> {
        self.retry.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MissionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<EntityChange> {
        self.changes.subscribe()
    }

    fn persist(&self, mission: &Mission) -> CoreResult<()> {
        self.repo
            .put_json(&keys::mission(&mission.mission_id), mission)
    }

    fn notify_change(&self, op: SyncOpKind, mission_id: &str) {
        let _ = self.changes.send(EntityChange {
            op,
            entity: EntityKind::Mission,
            entity_id: mission_id.to_string(),
        });
    }

    fn record_event(
        &self,
        mission_id: &str,
        event: MissionEventKind,
        details: serde_json::Value,
    ) {
        let entry = MissionEvent {
            mission_id: mission_id.to_string(),
            event,
            timestamp: ids::unix_secs(),
            details,
        };
        if let Ok(mut journal) = self.journal.lock() {
            if journal.len() >= EVENT_JOURNAL_CAP {
                journal.pop_front();
            }
            journal.push_back(entry.clone());
        }
        let _ = self.events.send(entry);
    }

    /// Most recent journal entries, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<MissionEvent> {
        self.journal
            .lock()
            .map(|journal| journal.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------

    pub fn create(&self, req: CreateMissionRequest) -> CoreResult<Mission> {
        if req.name.trim().is_empty() {
            return Err(CoreError::Validation("mission name cannot be empty".into()));
        }
        if let Some(area) = &req.area {
            area.validate()?;
        }
        let now = ids::unix_secs();
        let requested = req
            .requested_uavs
            .unwrap_or_else(|| req.uav_list.len().max(1));

        let mission = Mission {
            mission_id: self.idgen.next("mission"),
            name: req.name,
            description: req.description,
            kind: req.kind,
            profile: req.profile,
            uav_list: req.uav_list,
            payload: req.payload,
            priority: req.priority,
            state: MissionState::Pending,
            progress: 0.0,
            area: req.area,
            requested_uavs: requested,
            on_shortfall: req.on_shortfall,
            retry_of: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        self.persist(&mission)?;
        self.missions
            .insert(mission.mission_id.clone(), mission.clone());
        self.record_event(
            &mission.mission_id,
            MissionEventKind::Created,
            serde_json::json!({ "name": mission.name }),
        );
        self.notify_change(SyncOpKind::Create, &mission.mission_id);
        info!(mission_id = %mission.mission_id, name = %mission.name, "Mission created");
        Ok(mission)
    }

    pub fn get(&self, mission_id: &str) -> CoreResult<Mission> {
        self.missions
            .get(mission_id)
            .map(|m| m.clone())
            .ok_or_else(|| CoreError::NotFound(format!("mission {mission_id}")))
    }

    pub fn list(&self) -> Vec<Mission> {
        let mut all: Vec<Mission> = self.missions.iter().map(|m| m.clone()).collect();
        all.sort_by(|a, b| a.mission_id.cmp(&b.mission_id));
        all
    }

    /// Admit and launch a PENDING mission.
    ///
    /// Vehicle selection either honours the caller-supplied list or
    /// auto-picks through the greedy assigner. Selected vehicles flip to
    /// BUSY atomically; a capacity shortfall either fails the dispatch or
    /// downgrades the vehicle count, per the mission's shortfall policy.
    pub fn dispatch(&self, mission_id: &str) -> CoreResult<Mission> {
        let mission = self.get(mission_id)?;
        if mission.state != MissionState::Pending {
            return Err(CoreError::InvalidState(format!(
                "mission {mission_id} is {}; dispatch requires PENDING",
                mission.state.as_str()
            )));
        }

        let selected = self.select_uavs(&mission)?;

        // Lock order: UAV table first, then the mission table.
        self.fleet.bind_mission(&selected, mission_id)?;

        let result = (|| -> CoreResult<Mission> {
            let mut entry = self
                .missions
                .get_mut(mission_id)
                .ok_or_else(|| CoreError::NotFound(format!("mission {mission_id}")))?;
            entry.uav_list = selected.clone();
            entry.transition(MissionState::Running, ids::unix_secs())?;
            let snapshot = entry.clone();
            drop(entry);
            self.persist(&snapshot)?;
            Ok(snapshot)
        })();

        match result {
            Ok(snapshot) => {
                self.record_event(
                    mission_id,
                    MissionEventKind::Dispatched,
                    serde_json::json!({ "uav_list": snapshot.uav_list }),
                );
                self.notify_change(SyncOpKind::Update, mission_id);
                info!(
                    mission_id = %mission_id,
                    uavs = snapshot.uav_list.len(),
                    "Mission dispatched"
                );
                Ok(snapshot)
            }
            Err(e) => {
                // Unbind on any failure past the bind.
                let _ = self.fleet.release_mission(mission_id);
                Err(e)
            }
        }
    }

    /// Pick vehicles for a mission according to its kind and shortfall
    /// policy. Returns CAPACITY_EXHAUSTED when admission cannot proceed.
    fn select_uavs(&self, mission: &Mission) -> CoreResult<Vec<String>> {
        let available = self.fleet.available_uavs();
        let area = mission.area.clone().unwrap_or_else(|| {
            // Missions without a polygon still need an altitude requirement
            // for the capability checks.
            Area::new(
                vec![
                    crate::types::GeoPoint::new(0.0, 0.0, 0.0),
                    crate::types::GeoPoint::new(0.0, 0.001, 0.0),
                    crate::types::GeoPoint::new(0.001, 0.001, 0.0),
                ],
                0.0,
                0.0,
            )
        });

        match mission.kind {
            MissionKind::SingleUav => {
                if let Some(requested) = mission.uav_list.first() {
                    let uav = self
                        .fleet
                        .get(requested)
                        .ok_or_else(|| CoreError::NotFound(format!("uav {requested}")))?;
                    if !uav.is_available() {
                        return Err(CoreError::CapacityExhausted(format!(
                            "uav {requested} is not available"
                        )));
                    }
                    return Ok(vec![requested.clone()]);
                }
                let candidates: Vec<Candidate> = available.iter().map(Candidate::from).collect();
                let picked = assigner::assign(
                    &AssignStrategy::Greedy,
                    &area,
                    1,
                    &candidates,
                    seed_for(&mission.mission_id),
                )?;
                if picked.is_empty() {
                    return Err(CoreError::CapacityExhausted(
                        "no available UAV satisfies the mission requirements".into(),
                    ));
                }
                Ok(picked)
            }
            MissionKind::MultiUav | MissionKind::Cluster => {
                let requested = mission.requested_uavs.max(1);
                let pool: Vec<String> = if mission.uav_list.is_empty() {
                    available.iter().map(|u| u.uav_id.clone()).collect()
                } else {
                    mission
                        .uav_list
                        .iter()
                        .filter(|id| available.iter().any(|u| &u.uav_id == *id))
                        .cloned()
                        .collect()
                };
                let capacity = pool.len().min(requested);
                if capacity == 0 {
                    return Err(CoreError::CapacityExhausted(
                        "no available UAVs for dispatch".into(),
                    ));
                }
                if capacity < requested && mission.on_shortfall == ShortfallPolicy::Fail {
                    return Err(CoreError::CapacityExhausted(format!(
                        "requested {requested} UAVs, only {capacity} available"
                    )));
                }

                if mission.uav_list.is_empty() {
                    let candidates: Vec<Candidate> =
                        available.iter().map(Candidate::from).collect();
                    let picked = assigner::assign(
                        &AssignStrategy::Greedy,
                        &area,
                        capacity,
                        &candidates,
                        seed_for(&mission.mission_id),
                    )?;
                    if picked.is_empty() {
                        return Err(CoreError::CapacityExhausted(
                            "no available UAV satisfies the mission requirements".into(),
                        ));
                    }
                    Ok(picked)
                } else {
                    Ok(pool.into_iter().take(capacity).collect())
                }
            }
        }
    }

    pub fn pause(&self, mission_id: &str) -> CoreResult<Mission> {
        let snapshot = self.transition(mission_id, MissionState::Paused)?;
        self.record_event(mission_id, MissionEventKind::Paused, serde_json::json!({}));
        self.notify_change(SyncOpKind::Update, mission_id);
        Ok(snapshot)
    }

    pub fn resume(&self, mission_id: &str) -> CoreResult<Mission> {
        let snapshot = self.transition(mission_id, MissionState::Running)?;
        self.record_event(mission_id, MissionEventKind::Resumed, serde_json::json!({}));
        self.notify_change(SyncOpKind::Update, mission_id);
        Ok(snapshot)
    }

    pub fn cancel(&self, mission_id: &str) -> CoreResult<Mission> {
        let snapshot = self.transition(mission_id, MissionState::Cancelled)?;
        let released = self.fleet.release_mission(mission_id)?;
        self.record_event(
            mission_id,
            MissionEventKind::Cancelled,
            serde_json::json!({ "released_uavs": released }),
        );
        self.notify_change(SyncOpKind::Update, mission_id);
        Ok(snapshot)
    }

    /// Terminal completion. A success pins progress to 1.0; a failure may
    /// schedule a retry attempt according to the retry manager.
    pub fn complete(
        &self,
        mission_id: &str,
        success: bool,
        error: Option<&str>,
    ) -> CoreResult<Mission> {
        let now = ids::unix_secs();
        let snapshot = {
            let mut entry = self
                .missions
                .get_mut(mission_id)
                .ok_or_else(|| CoreError::NotFound(format!("mission {mission_id}")))?;
            let target = if success {
                MissionState::Succeeded
            } else {
                MissionState::Failed
            };
            entry.transition(target, now)?;
            if success {
                entry.progress = 1.0;
            }
            let snapshot = entry.clone();
            drop(entry);
            self.persist(&snapshot)?;
            snapshot
        };

        self.fleet.release_mission(mission_id)?;
        let root_id = snapshot.retry_of.clone().unwrap_or_else(|| mission_id.to_string());
        self.retry.record_outcome(&root_id, snapshot.profile, success);

        if success {
            self.record_event(mission_id, MissionEventKind::Succeeded, serde_json::json!({}));
        } else {
            let class = error.map_or(ErrorClass::Unknown, ErrorClass::classify);
            let scheduled = self.retry.schedule(&root_id, snapshot.profile, class, now);
            self.record_event(
                mission_id,
                MissionEventKind::Failed,
                serde_json::json!({
                    "error": error,
                    "error_class": class,
                    "retry_at": scheduled,
                }),
            );
        }
        self.notify_change(SyncOpKind::Update, mission_id);
        Ok(self.get(mission_id)?)
    }

    pub fn update_progress(&self, mission_id: &str, progress: f64) -> CoreResult<Mission> {
        let mut entry = self
            .missions
            .get_mut(mission_id)
            .ok_or_else(|| CoreError::NotFound(format!("mission {mission_id}")))?;
        entry.update_progress(progress, ids::unix_secs())?;
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot)?;
        self.notify_change(SyncOpKind::Update, mission_id);
        Ok(snapshot)
    }

    /// Delete is permitted only in a terminal state.
    pub fn delete(&self, mission_id: &str) -> CoreResult<()> {
        let mission = self.get(mission_id)?;
        if !mission.state.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "mission {mission_id} is {}; delete requires a terminal state",
                mission.state.as_str()
            )));
        }
        self.missions.remove(mission_id);
        self.repo.delete(&keys::mission(mission_id))?;
        self.record_event(mission_id, MissionEventKind::Deleted, serde_json::json!({}));
        self.notify_change(SyncOpKind::Delete, mission_id);
        Ok(())
    }

    fn transition(&self, mission_id: &str, to: MissionState) -> CoreResult<Mission> {
        let mut entry = self
            .missions
            .get_mut(mission_id)
            .ok_or_else(|| CoreError::NotFound(format!("mission {mission_id}")))?;
        entry.transition(to, ids::unix_secs())?;
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    // -----------------------------------------------------------------
    // Cluster missions
    // -----------------------------------------------------------------

    /// Create a cluster mission: pick vehicles, split the polygon, create
    /// and dispatch one sub-mission per (vehicle, sub-area) pair.
    pub fn create_cluster_mission(
        &self,
        req: CreateClusterMissionRequest,
    ) -> CoreResult<ClusterMission> {
        req.area.validate()?;
        if req.uav_count == 0 {
            return Err(CoreError::Validation("uav_count must be positive".into()));
        }

        let available = self.fleet.available_uavs();
        let capacity = available.len().min(req.uav_count);
        if capacity == 0 {
            return Err(CoreError::CapacityExhausted(
                "no available UAVs for cluster mission".into(),
            ));
        }
        if capacity < req.uav_count && req.on_shortfall == ShortfallPolicy::Fail {
            return Err(CoreError::CapacityExhausted(format!(
                "requested {} UAVs, only {capacity} available",
                req.uav_count
            )));
        }

        let candidates: Vec<Candidate> = available.iter().map(Candidate::from).collect();
        let cluster_mission_id = self.idgen.next("cmission");
        let picked = assigner::assign(
            &AssignStrategy::Greedy,
            &req.area,
            capacity,
            &candidates,
            seed_for(&cluster_mission_id),
        )?;
        if picked.is_empty() {
            return Err(CoreError::CapacityExhausted(
                "no available UAV satisfies the cluster mission requirements".into(),
            ));
        }

        let plan_info: Vec<UavPlanInfo> = picked
            .iter()
            .filter_map(|id| available.iter().find(|u| &u.uav_id == id))
            .map(UavPlanInfo::from)
            .collect();
        let sub_areas = splitter::split_area(&req.area, req.split_method, &plan_info)?;

        let mut sub_missions = Vec::with_capacity(picked.len());
        for (i, (uav_id, sub_area)) in picked.iter().zip(sub_areas.into_iter()).enumerate() {
            let sub = self.create(CreateMissionRequest {
                name: format!("{} [{}]", req.name, i + 1),
                description: format!("sub-mission of {cluster_mission_id}"),
                kind: MissionKind::Cluster,
                profile: req.profile,
                uav_list: vec![uav_id.clone()],
                payload: serde_json::json!({ "cluster_mission_id": cluster_mission_id }),
                priority: req.priority,
                area: Some(sub_area.clone()),
                requested_uavs: Some(1),
                on_shortfall: ShortfallPolicy::Fail,
            })?;
            sub_missions.push(SubMissionAssignment {
                mission_id: sub.mission_id,
                uav_id: uav_id.clone(),
                area: sub_area,
            });
        }

        // Dispatch each sub-mission; failures roll back everything created
        // so far so a cluster mission never launches half-assigned.
        for (done, sub) in sub_missions.iter().enumerate() {
            if let Err(e) = self.dispatch(&sub.mission_id) {
                warn!(
                    cluster_mission_id = %cluster_mission_id,
                    mission_id = %sub.mission_id,
                    error = %e,
                    "Cluster dispatch failed, rolling back"
                );
                for prior in &sub_missions[..done] {
                    let _ = self.cancel(&prior.mission_id);
                }
                for created in &sub_missions {
                    let _ = self.delete_any_state(&created.mission_id);
                }
                return Err(e);
            }
        }

        let cluster = ClusterMission {
            cluster_mission_id: cluster_mission_id.clone(),
            name: req.name,
            kind: req.kind,
            area: req.area,
            sub_missions,
            created_at: ids::unix_secs(),
        };
        self.repo
            .put_json(&keys::cluster(&cluster_mission_id), &cluster)?;
        info!(
            cluster_mission_id = %cluster_mission_id,
            sub_missions = cluster.sub_missions.len(),
            "Cluster mission created"
        );
        Ok(cluster)
    }

    pub fn get_cluster_mission(&self, cluster_mission_id: &str) -> CoreResult<ClusterMission> {
        self.repo
            .get_json(&keys::cluster(cluster_mission_id))?
            .ok_or_else(|| CoreError::NotFound(format!("cluster mission {cluster_mission_id}")))
    }

    /// Deleting a cluster mission requires all sub-missions terminal.
    pub fn delete_cluster_mission(&self, cluster_mission_id: &str) -> CoreResult<()> {
        let cluster = self.get_cluster_mission(cluster_mission_id)?;
        for sub in &cluster.sub_missions {
            if let Ok(mission) = self.get(&sub.mission_id) {
                if !mission.state.is_terminal() {
                    return Err(CoreError::InvalidState(format!(
                        "sub-mission {} is {}; cluster delete requires all terminal",
                        sub.mission_id,
                        mission.state.as_str()
                    )));
                }
            }
        }
        self.repo.delete(&keys::cluster(cluster_mission_id))
    }

    /// Rollback helper: remove a mission regardless of state.
    fn delete_any_state(&self, mission_id: &str) -> CoreResult<()> {
        self.missions.remove(mission_id);
        self.repo.delete(&keys::mission(mission_id))
    }

    // -----------------------------------------------------------------
    // Replication hooks
    // -----------------------------------------------------------------

    /// Apply a replicated mission record without re-announcing it.
    pub fn apply_replicated(&self, mission: Mission) -> CoreResult<()> {
        self.persist(&mission)?;
        self.missions.insert(mission.mission_id.clone(), mission);
        Ok(())
    }

    /// Apply a replicated removal without re-announcing it.
    pub fn remove_replicated(&self, mission_id: &str) -> CoreResult<()> {
        self.missions.remove(mission_id);
        self.repo.delete(&keys::mission(mission_id))
    }

    // -----------------------------------------------------------------
    // Priority dispatch loop
    // -----------------------------------------------------------------

    /// One pass of the priority dispatch loop: resurrect due retries,
    /// then walk PENDING missions in descending priority (earliest first
    /// on ties) and attempt dispatch. Capacity shortfalls leave the
    /// mission PENDING for the next tick.
    pub fn dispatch_tick(&self) -> usize {
        self.resurrect_due_retries();

        let mut pending: Vec<Mission> = self
            .missions
            .iter()
            .filter(|m| m.state == MissionState::Pending)
            .map(|m| m.clone())
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.mission_id.cmp(&b.mission_id))
        });

        let mut dispatched = 0;
        for mission in pending {
            match self.dispatch(&mission.mission_id) {
                Ok(_) => dispatched += 1,
                Err(CoreError::CapacityExhausted(reason)) => {
                    debug!(
                        mission_id = %mission.mission_id,
                        reason = %reason,
                        "Dispatch deferred, staying PENDING"
                    );
                }
                Err(e) => {
                    warn!(mission_id = %mission.mission_id, error = %e, "Dispatch failed");
                }
            }
        }
        dispatched
    }

    /// Turn due retries into fresh PENDING attempts. Terminal states are
    /// absorbing, so a retry is a new mission pointing back at the failed
    /// one through `retry_of`.
    fn resurrect_due_retries(&self) {
        for root_id in self.retry.due(ids::unix_secs()) {
            let Ok(failed) = self.get(&root_id) else {
                continue;
            };
            let attempt = self.retry.attempts(&root_id);
            let req = CreateMissionRequest {
                name: format!("{} (retry {attempt})", failed.name),
                description: failed.description.clone(),
                kind: failed.kind,
                profile: failed.profile,
                uav_list: Vec::new(),
                payload: failed.payload.clone(),
                priority: failed.priority,
                area: failed.area.clone(),
                requested_uavs: Some(failed.requested_uavs),
                on_shortfall: failed.on_shortfall,
            };
            match self.create(req) {
                Ok(mut attempt_mission) => {
                    attempt_mission.retry_of = Some(root_id.clone());
                    if self.apply_replicated(attempt_mission.clone()).is_ok() {
                        info!(
                            mission_id = %attempt_mission.mission_id,
                            retry_of = %root_id,
                            attempt,
                            "Retry attempt queued"
                        );
                    }
                }
                Err(e) => warn!(retry_of = %root_id, error = %e, "Could not queue retry"),
            }
        }
    }

    pub async fn run_dispatch_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval =
            Duration::from_secs(crate::config::get().scheduler.dispatch_interval_secs);
        info!(interval_secs = interval.as_secs(), "Priority dispatch loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Priority dispatch loop stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    let n = self.dispatch_tick();
                    if n > 0 {
                        debug!(dispatched = n, "Dispatch tick complete");
                    }
                }
            }
        }
    }
}

/// Deterministic per-mission seed (FNV-1a over the id).
fn seed_for(mission_id: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in mission_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledRepository;
    use crate::types::{GeoPoint, UavCapabilities, UavStatus};

    fn setup() -> (Arc<FleetInventory>, MissionScheduler) {
        let repo: Arc<dyn Repository> = Arc::new(SledRepository::open_temporary().unwrap());
        let fleet = Arc::new(FleetInventory::open(repo.clone()).unwrap());
        let scheduler = MissionScheduler::open(repo, fleet.clone()).unwrap();
        (fleet, scheduler)
    }

    fn caps(max_alt: f64, battery: f64) -> UavCapabilities {
        UavCapabilities {
            max_altitude_m: max_alt,
            current_battery: battery,
            ..UavCapabilities::default()
        }
    }

    fn single_uav_request(name: &str, priority: i32, uav_list: Vec<String>) -> CreateMissionRequest {
        CreateMissionRequest {
            name: name.into(),
            description: String::new(),
            kind: MissionKind::SingleUav,
            profile: MissionProfile::Other,
            uav_list,
            payload: serde_json::json!({}),
            priority,
            area: None,
            requested_uavs: None,
            on_shortfall: ShortfallPolicy::Fail,
        }
    }

    fn square_area() -> Area {
        Area::new(
            vec![
                GeoPoint::new(0.0, 0.0, 0.0),
                GeoPoint::new(1.0, 0.0, 0.0),
                GeoPoint::new(1.0, 1.0, 0.0),
                GeoPoint::new(0.0, 1.0, 0.0),
            ],
            0.0,
            100.0,
        )
    }

    #[test]
    fn test_single_uav_happy_path() {
        let (fleet, scheduler) = setup();
        fleet.register("u1", caps(120.0, 100.0), serde_json::json!({})).unwrap();

        let mission = scheduler
            .create(single_uav_request("m1", 0, vec!["u1".into()]))
            .unwrap();
        let id = mission.mission_id.clone();

        let dispatched = scheduler.dispatch(&id).unwrap();
        assert_eq!(dispatched.state, MissionState::Running);
        let uav = fleet.get("u1").unwrap();
        assert_eq!(uav.status, UavStatus::Busy);
        assert_eq!(uav.current_mission.as_deref(), Some(id.as_str()));

        scheduler.update_progress(&id, 0.5).unwrap();
        let done = scheduler.complete(&id, true, None).unwrap();
        assert_eq!(done.state, MissionState::Succeeded);
        assert_eq!(done.progress, 1.0);

        let uav = fleet.get("u1").unwrap();
        assert_eq!(uav.status, UavStatus::Idle);
        assert!(uav.current_mission.is_none());
    }

    #[test]
    fn test_priority_dispatch_order() {
        let (fleet, scheduler) = setup();
        fleet.register("u1", caps(120.0, 100.0), serde_json::json!({})).unwrap();

        let low = scheduler.create(single_uav_request("low", 0, vec![])).unwrap();
        let mid = scheduler.create(single_uav_request("mid", 5, vec![])).unwrap();
        let high = scheduler.create(single_uav_request("high", 10, vec![])).unwrap();

        let dispatched = scheduler.dispatch_tick();
        assert_eq!(dispatched, 1);
        assert_eq!(scheduler.get(&high.mission_id).unwrap().state, MissionState::Running);
        assert_eq!(scheduler.get(&mid.mission_id).unwrap().state, MissionState::Pending);
        assert_eq!(scheduler.get(&low.mission_id).unwrap().state, MissionState::Pending);
    }

    #[test]
    fn test_dispatch_with_no_uavs_leaves_pending() {
        let (_fleet, scheduler) = setup();
        let mission = scheduler.create(single_uav_request("m1", 0, vec![])).unwrap();
        let err = scheduler.dispatch(&mission.mission_id);
        assert!(matches!(err, Err(CoreError::CapacityExhausted(_))));
        assert_eq!(
            scheduler.get(&mission.mission_id).unwrap().state,
            MissionState::Pending
        );
    }

    #[test]
    fn test_dispatch_then_cancel_releases_uavs() {
        let (fleet, scheduler) = setup();
        fleet.register("u1", caps(120.0, 100.0), serde_json::json!({})).unwrap();
        fleet.register("u2", caps(120.0, 90.0), serde_json::json!({})).unwrap();

        let mission = scheduler
            .create(CreateMissionRequest {
                requested_uavs: Some(2),
                kind: MissionKind::MultiUav,
                ..single_uav_request("m1", 0, vec![])
            })
            .unwrap();
        scheduler.dispatch(&mission.mission_id).unwrap();
        scheduler.cancel(&mission.mission_id).unwrap();

        for id in ["u1", "u2"] {
            let uav = fleet.get(id).unwrap();
            assert_ne!(uav.status, UavStatus::Busy);
            assert!(uav.current_mission.is_none());
        }
    }

    #[test]
    fn test_pause_resume_keeps_progress() {
        let (fleet, scheduler) = setup();
        fleet.register("u1", caps(120.0, 100.0), serde_json::json!({})).unwrap();
        let mission = scheduler
            .create(single_uav_request("m1", 0, vec!["u1".into()]))
            .unwrap();
        scheduler.dispatch(&mission.mission_id).unwrap();
        scheduler.update_progress(&mission.mission_id, 0.4).unwrap();

        scheduler.pause(&mission.mission_id).unwrap();
        let resumed = scheduler.resume(&mission.mission_id).unwrap();
        assert_eq!(resumed.progress, 0.4);
        assert_eq!(resumed.state, MissionState::Running);
    }

    #[test]
    fn test_invalid_transitions_surface() {
        let (_fleet, scheduler) = setup();
        let mission = scheduler.create(single_uav_request("m1", 0, vec![])).unwrap();

        // Pausing a PENDING mission is not an edge.
        assert!(matches!(
            scheduler.pause(&mission.mission_id),
            Err(CoreError::InvalidState(_))
        ));
    }

    #[test]
    fn test_delete_requires_terminal() {
        let (_fleet, scheduler) = setup();
        let mission = scheduler.create(single_uav_request("m1", 0, vec![])).unwrap();
        assert!(scheduler.delete(&mission.mission_id).is_err());

        scheduler.cancel(&mission.mission_id).unwrap();
        scheduler.delete(&mission.mission_id).unwrap();
        assert!(scheduler.get(&mission.mission_id).is_err());
    }

    #[test]
    fn test_shortfall_downgrade_vs_fail() {
        let (fleet, scheduler) = setup();
        fleet.register("u1", caps(120.0, 100.0), serde_json::json!({})).unwrap();

        let fail = scheduler
            .create(CreateMissionRequest {
                kind: MissionKind::MultiUav,
                requested_uavs: Some(3),
                on_shortfall: ShortfallPolicy::Fail,
                ..single_uav_request("fail", 0, vec![])
            })
            .unwrap();
        assert!(matches!(
            scheduler.dispatch(&fail.mission_id),
            Err(CoreError::CapacityExhausted(_))
        ));

        let downgrade = scheduler
            .create(CreateMissionRequest {
                kind: MissionKind::MultiUav,
                requested_uavs: Some(3),
                on_shortfall: ShortfallPolicy::Downgrade,
                ..single_uav_request("downgrade", 0, vec![])
            })
            .unwrap();
        let dispatched = scheduler.dispatch(&downgrade.mission_id).unwrap();
        assert_eq!(dispatched.uav_list.len(), 1);
        assert_eq!(dispatched.state, MissionState::Running);
    }

    #[test]
    fn test_failure_schedules_retry_attempt() {
        let (fleet, scheduler) = setup();
        fleet.register("u1", caps(120.0, 100.0), serde_json::json!({})).unwrap();
        let mission = scheduler
            .create(single_uav_request("m1", 0, vec!["u1".into()]))
            .unwrap();
        scheduler.dispatch(&mission.mission_id).unwrap();
        let failed = scheduler
            .complete(&mission.mission_id, false, Some("connection refused"))
            .unwrap();
        assert_eq!(failed.state, MissionState::Failed);
        assert_eq!(scheduler.retry_manager().attempts(&mission.mission_id), 1);

        // Terminal states are absorbing: the record stays FAILED.
        assert_eq!(
            scheduler.get(&mission.mission_id).unwrap().state,
            MissionState::Failed
        );
    }

    #[test]
    fn test_validation_error_not_retried() {
        let (fleet, scheduler) = setup();
        fleet.register("u1", caps(120.0, 100.0), serde_json::json!({})).unwrap();
        let mission = scheduler
            .create(single_uav_request("m1", 0, vec!["u1".into()]))
            .unwrap();
        scheduler.dispatch(&mission.mission_id).unwrap();
        scheduler
            .complete(&mission.mission_id, false, Some("validation failed: bad polygon"))
            .unwrap();
        assert_eq!(scheduler.retry_manager().attempts(&mission.mission_id), 0);
    }

    #[test]
    fn test_cluster_mission_creation_and_delete_guard() {
        let (fleet, scheduler) = setup();
        for i in 0..3 {
            fleet
                .register(&format!("u{i}"), caps(120.0, 100.0 - i as f64 * 10.0), serde_json::json!({}))
                .unwrap();
        }

        let cluster = scheduler
            .create_cluster_mission(CreateClusterMissionRequest {
                name: "sweep".into(),
                kind: ClusterMissionKind::SearchRescue,
                area: square_area(),
                uav_count: 3,
                profile: MissionProfile::Search,
                split_method: SplitMethod::Equal,
                priority: 0,
                on_shortfall: ShortfallPolicy::Fail,
            })
            .unwrap();
        assert_eq!(cluster.sub_missions.len(), 3);

        // Every sub-mission is RUNNING on its own vehicle.
        let mut seen = std::collections::HashSet::new();
        for sub in &cluster.sub_missions {
            let mission = scheduler.get(&sub.mission_id).unwrap();
            assert_eq!(mission.state, MissionState::Running);
            assert!(seen.insert(sub.uav_id.clone()), "vehicle reused");
        }

        // Delete refused while sub-missions are live.
        assert!(scheduler
            .delete_cluster_mission(&cluster.cluster_mission_id)
            .is_err());

        for sub in &cluster.sub_missions {
            scheduler.complete(&sub.mission_id, true, None).unwrap();
        }
        scheduler
            .delete_cluster_mission(&cluster.cluster_mission_id)
            .unwrap();
    }

    #[test]
    fn test_mission_events_journal() {
        let (fleet, scheduler) = setup();
        fleet.register("u1", caps(120.0, 100.0), serde_json::json!({})).unwrap();
        let mission = scheduler
            .create(single_uav_request("m1", 0, vec!["u1".into()]))
            .unwrap();
        scheduler.dispatch(&mission.mission_id).unwrap();
        scheduler.complete(&mission.mission_id, true, None).unwrap();

        let events = scheduler.recent_events(10);
        let kinds: Vec<MissionEventKind> = events.iter().map(|e| e.event).collect();
        assert!(kinds.contains(&MissionEventKind::Created));
        assert!(kinds.contains(&MissionEventKind::Dispatched));
        assert!(kinds.contains(&MissionEventKind::Succeeded));
        // Newest first.
        assert_eq!(events[0].event, MissionEventKind::Succeeded);
    }

    #[test]
    fn test_seed_is_stable() {
        assert_eq!(seed_for("mission_1"), seed_for("mission_1"));
        assert_ne!(seed_for("mission_1"), seed_for("mission_2"));
    }
}
