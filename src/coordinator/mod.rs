//! Multi-UAV coordinator.
//!
//! Tracks per-vehicle mission state for every active sub-mission, detects
//! separation conflicts between cooperating vehicles, reassigns work away
//! from failed vehicles, suggests load rebalancing, and aggregates cluster
//! progress. Detected targets are registered here and surfaced to viewers.

pub mod conflict;

pub use conflict::{
    avoidance_waypoint, detect_path_conflicts, replan_path, Conflict, ConflictKind, FlightPath,
    Obstacle, Velocity, Waypoint,
};

use crate::error::{CoreError, CoreResult};
use crate::ids;
use crate::types::{
    haversine_m, Area, ClusterMission, CoordinationEventKind, CoordinationMessage, GeoPoint, Uav,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubMissionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

/// Coordinator view of one vehicle's sub-mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UavMissionState {
    pub uav_id: String,
    pub mission_id: String,
    pub cluster_mission_id: String,
    #[serde(default)]
    pub assigned_area: Option<Area>,
    pub position: GeoPoint,
    pub waypoint_index: u32,
    pub progress: f64,
    pub status: SubMissionStatus,
    pub battery_percent: f64,
    /// Unix seconds of the last update.
    pub last_update: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterProgress {
    pub cluster_mission_id: String,
    pub total_progress: f64,
    pub uav_count: usize,
    pub completed_count: usize,
    pub running_count: usize,
    pub failed_count: usize,
    pub uav_states: Vec<UavMissionState>,
}

/// A target detected by a vehicle during a mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    pub target_id: String,
    pub position: GeoPoint,
    pub detected_by: String,
    pub detected_at: u64,
    pub confidence: f64,
    #[serde(default = "default_target_type")]
    pub target_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_target_type() -> String {
    "UNKNOWN".to_string()
}

/// One suggested mission move from an overloaded vehicle to an idle one.
/// Suggestions are advisory; nothing moves without operator opt-in.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceSuggestion {
    pub mission_id: String,
    pub from_uav: String,
    pub to_uav: String,
    pub load_gap: f64,
}

/// A completed reassignment away from a failed vehicle.
#[derive(Debug, Clone, Serialize)]
pub struct Reassignment {
    pub mission_id: String,
    pub from_uav: String,
    pub to_uav: String,
}

pub struct Coordinator {
    /// Keyed by uav id; one active sub-mission per vehicle.
    states: DashMap<String, UavMissionState>,
    cluster_missions: DashMap<String, ClusterMission>,
    targets: DashMap<String, TargetInfo>,
    events: broadcast::Sender<CoordinationMessage>,
    min_separation_m: f64,
    avoidance_radius_m: f64,
}

impl Coordinator {
    pub fn new(min_separation_m: f64, avoidance_radius_m: f64) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            states: DashMap::new(),
            cluster_missions: DashMap::new(),
            targets: DashMap::new(),
            events,
            min_separation_m,
            avoidance_radius_m,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinationMessage> {
        self.events.subscribe()
    }

    pub fn avoidance_radius_m(&self) -> f64 {
        self.avoidance_radius_m
    }

    fn emit(&self, message: CoordinationMessage) {
        let _ = self.events.send(message);
    }

    /// Track a dispatched cluster mission: one state per sub-mission.
    pub fn register_cluster_mission(&self, cluster: &ClusterMission) {
        for sub in &cluster.sub_missions {
            self.states.insert(
                sub.uav_id.clone(),
                UavMissionState {
                    uav_id: sub.uav_id.clone(),
                    mission_id: sub.mission_id.clone(),
                    cluster_mission_id: cluster.cluster_mission_id.clone(),
                    assigned_area: Some(sub.area.clone()),
                    position: sub.area.centroid(),
                    waypoint_index: 0,
                    progress: 0.0,
                    status: SubMissionStatus::Running,
                    battery_percent: 100.0,
                    last_update: ids::unix_secs(),
                },
            );
        }
        self.cluster_missions
            .insert(cluster.cluster_mission_id.clone(), cluster.clone());
        info!(
            cluster_mission_id = %cluster.cluster_mission_id,
            uavs = cluster.sub_missions.len(),
            "Cluster mission registered for coordination"
        );
    }

    pub fn get_state(&self, uav_id: &str) -> Option<UavMissionState> {
        self.states.get(uav_id).map(|s| s.clone())
    }

    pub fn cluster_states(&self, cluster_mission_id: &str) -> Vec<UavMissionState> {
        let mut states: Vec<UavMissionState> = self
            .states
            .iter()
            .filter(|s| s.cluster_mission_id == cluster_mission_id)
            .map(|s| s.clone())
            .collect();
        states.sort_by(|a, b| a.uav_id.cmp(&b.uav_id));
        states
    }

    /// Position/progress/battery tick for a tracked vehicle. Returns the
    /// conflicts this update raised (also emitted on the event stream).
    pub fn update_state(
        &self,
        uav_id: &str,
        position: GeoPoint,
        progress: Option<f64>,
        battery_percent: Option<f64>,
    ) -> CoreResult<Vec<Conflict>> {
        {
            let mut entry = self
                .states
                .get_mut(uav_id)
                .ok_or_else(|| CoreError::NotFound(format!("no tracked mission for uav {uav_id}")))?;
            entry.position = position;
            if let Some(p) = progress {
                // Monotone per sub-mission, same as the scheduler table.
                entry.progress = entry.progress.max(p.clamp(0.0, 1.0));
            }
            if let Some(b) = battery_percent {
                entry.battery_percent = b;
            }
            entry.last_update = ids::unix_secs();
        }
        Ok(self.check_conflicts(uav_id))
    }

    /// Haversine sweep of one RUNNING vehicle against its cluster peers.
    pub fn check_conflicts(&self, uav_id: &str) -> Vec<Conflict> {
        let Some(current) = self.get_state(uav_id) else {
            return Vec::new();
        };
        if current.status != SubMissionStatus::Running {
            return Vec::new();
        }

        let mut conflicts = Vec::new();
        for other in self.states.iter() {
            if other.uav_id == uav_id
                || other.status != SubMissionStatus::Running
                || other.cluster_mission_id != current.cluster_mission_id
            {
                continue;
            }
            let distance = haversine_m(&current.position, &other.position);
            if distance < self.min_separation_m {
                let dt = current.last_update.abs_diff(other.last_update) as f64;
                let conflict = Conflict {
                    uav_id_a: current.uav_id.clone(),
                    uav_id_b: other.uav_id.clone(),
                    kind: ConflictKind::Position,
                    point: current.position,
                    time: current.last_update,
                    severity: conflict::conflict_severity(dt),
                };
                // Suggest an escape waypoint away from the intruder.
                let escape = conflict::avoidance_waypoint(
                    &current.position,
                    &conflict::Velocity::default(),
                    &[Obstacle {
                        position: other.position,
                        radius_m: self.avoidance_radius_m,
                    }],
                    self.avoidance_radius_m,
                );
                warn!(
                    uav_a = %conflict.uav_id_a,
                    uav_b = %conflict.uav_id_b,
                    distance_m = distance,
                    severity = conflict.severity,
                    "Collision risk detected"
                );
                self.emit(CoordinationMessage {
                    event: CoordinationEventKind::CollisionRisk,
                    cluster_mission_id: current.cluster_mission_id.clone(),
                    uav_id: current.uav_id.clone(),
                    timestamp: ids::unix_secs(),
                    data: serde_json::json!({
                        "other_uav_id": conflict.uav_id_b,
                        "distance_m": distance,
                        "min_separation_m": self.min_separation_m,
                        "severity": conflict.severity,
                        "avoidance_waypoint": escape,
                    }),
                });
                conflicts.push(conflict);
            }
        }
        conflicts
    }

    /// Apply a coordination event reported by a vehicle.
    pub fn handle_event(&self, message: CoordinationMessage) {
        if let Some(mut state) = self.states.get_mut(&message.uav_id) {
            match message.event {
                CoordinationEventKind::MissionStarted | CoordinationEventKind::MissionResumed => {
                    state.status = SubMissionStatus::Running;
                }
                CoordinationEventKind::MissionPaused => {
                    state.status = SubMissionStatus::Paused;
                }
                CoordinationEventKind::MissionCompleted => {
                    state.status = SubMissionStatus::Completed;
                    state.progress = 1.0;
                }
                CoordinationEventKind::MissionFailed => {
                    state.status = SubMissionStatus::Failed;
                }
                CoordinationEventKind::AreaCovered => {
                    if let Some(p) = message.data.get("progress").and_then(serde_json::Value::as_f64)
                    {
                        state.progress = state.progress.max(p.clamp(0.0, 1.0));
                    }
                }
                CoordinationEventKind::LowBattery => {
                    if let Some(b) = message
                        .data
                        .get("battery_percent")
                        .and_then(serde_json::Value::as_f64)
                    {
                        state.battery_percent = b;
                    }
                }
                CoordinationEventKind::TargetFound
                | CoordinationEventKind::CollisionRisk
                | CoordinationEventKind::PathConflict => {}
            }
            state.last_update = ids::unix_secs();
        }
        debug!(event = ?message.event, uav_id = %message.uav_id, "Coordination event");
        self.emit(message);
    }

    /// Mean sub-mission progress plus terminal counts.
    pub fn cluster_progress(&self, cluster_mission_id: &str) -> ClusterProgress {
        let states = self.cluster_states(cluster_mission_id);
        let uav_count = states.len();
        let total_progress = if uav_count == 0 {
            0.0
        } else {
            states.iter().map(|s| s.progress).sum::<f64>() / uav_count as f64
        };
        ClusterProgress {
            cluster_mission_id: cluster_mission_id.to_string(),
            total_progress,
            uav_count,
            completed_count: states
                .iter()
                .filter(|s| s.status == SubMissionStatus::Completed)
                .count(),
            running_count: states
                .iter()
                .filter(|s| s.status == SubMissionStatus::Running)
                .count(),
            failed_count: states
                .iter()
                .filter(|s| s.status == SubMissionStatus::Failed)
                .count(),
            uav_states: states,
        }
    }

    /// Move every RUNNING mission off a failed vehicle onto the best
    /// scoring healthy candidate: `0.4 battery + 0.4 idle-ness + 0.2
    /// proximity` with proximity `1 / (1 + km to the area center)`.
    pub fn reassign_from_failed(
        &self,
        failed_uav_id: &str,
        candidates: &[Uav],
    ) -> Vec<Reassignment> {
        let Some(failed_state) = self.get_state(failed_uav_id) else {
            return Vec::new();
        };
        if failed_state.status != SubMissionStatus::Running {
            return Vec::new();
        }

        let center = failed_state
            .assigned_area
            .as_ref()
            .map_or(failed_state.position, Area::centroid);

        let mut best: Option<(&Uav, f64)> = None;
        for candidate in candidates {
            if candidate.uav_id == failed_uav_id || !candidate.is_available() {
                continue;
            }
            // A vehicle that cannot reach the area ceiling is no candidate.
            if let Some(area) = &failed_state.assigned_area {
                if candidate.capabilities.max_altitude_m < area.max_altitude {
                    continue;
                }
            }
            let battery = candidate.capabilities.battery_ratio();
            let idleness = 1.0 - candidate.workload;
            let proximity = candidate.position.map_or(1.0, |p| {
                let km = haversine_m(&center, &p) / 1000.0;
                1.0 / (1.0 + km)
            });
            let score = 0.4 * battery + 0.4 * idleness + 0.2 * proximity;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((candidate, score));
            }
        }

        let Some((winner, score)) = best else {
            warn!(uav_id = %failed_uav_id, "No candidate for reassignment");
            return Vec::new();
        };

        let mut state = failed_state;
        let mission_id = state.mission_id.clone();
        self.states.remove(failed_uav_id);
        state.uav_id = winner.uav_id.clone();
        state.last_update = ids::unix_secs();
        self.states.insert(winner.uav_id.clone(), state.clone());

        info!(
            mission_id = %mission_id,
            from = %failed_uav_id,
            to = %winner.uav_id,
            score,
            "Mission reassigned"
        );
        self.emit(CoordinationMessage {
            event: CoordinationEventKind::MissionResumed,
            cluster_mission_id: state.cluster_mission_id,
            uav_id: winner.uav_id.clone(),
            timestamp: ids::unix_secs(),
            data: serde_json::json!({
                "reassigned": true,
                "mission_id": mission_id,
                "from_uav": failed_uav_id,
            }),
        });
        vec![Reassignment {
            mission_id,
            from_uav: failed_uav_id.to_string(),
            to_uav: winner.uav_id.clone(),
        }]
    }

    /// Load-balance pass. Per-vehicle load is
    /// `min(active_missions / 5, 0.5) + 0.5 * workload`; a gap above 0.2
    /// between the most and least loaded vehicle yields one suggestion.
    pub fn load_balance_suggestions(&self, uavs: &[Uav]) -> Vec<RebalanceSuggestion> {
        if uavs.len() < 2 {
            return Vec::new();
        }

        let load_of = |uav: &Uav| -> f64 {
            let active = self
                .states
                .iter()
                .filter(|s| s.uav_id == uav.uav_id && s.status == SubMissionStatus::Running)
                .count() as f64;
            (active / 5.0).min(0.5) + 0.5 * uav.workload
        };

        let mut loads: Vec<(&Uav, f64)> = uavs.iter().map(|u| (u, load_of(u))).collect();
        loads.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let (min_uav, min_load) = loads[0];
        let (max_uav, max_load) = loads[loads.len() - 1];
        let gap = max_load - min_load;
        if gap <= 0.2 {
            return Vec::new();
        }

        // Move one running mission off the most loaded vehicle.
        let Some(mission_id) = self
            .states
            .iter()
            .find(|s| s.uav_id == max_uav.uav_id && s.status == SubMissionStatus::Running)
            .map(|s| s.mission_id.clone())
        else {
            return Vec::new();
        };

        vec![RebalanceSuggestion {
            mission_id,
            from_uav: max_uav.uav_id.clone(),
            to_uav: min_uav.uav_id.clone(),
            load_gap: gap,
        }]
    }

    /// Cooperative path replanning: sweep the path against its peers and,
    /// on conflict, detour around the most severe one. Returns `None`
    /// when the path is already clear.
    pub fn replan_conflicting_path(
        &self,
        path: &FlightPath,
        others: &[FlightPath],
    ) -> Option<(FlightPath, Vec<Conflict>)> {
        let conflicts = conflict::detect_path_conflicts(path, others, self.min_separation_m);
        let worst = conflicts
            .iter()
            .max_by(|a, b| {
                a.severity
                    .partial_cmp(&b.severity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?
            .clone();

        let replanned = conflict::replan_path(path, &worst, self.min_separation_m);
        info!(
            uav_id = %path.uav_id,
            conflicts = conflicts.len(),
            worst_severity = worst.severity,
            "Path replanned around conflict"
        );
        let cluster_mission_id = self
            .get_state(&path.uav_id)
            .map(|s| s.cluster_mission_id)
            .unwrap_or_default();
        self.emit(CoordinationMessage {
            event: CoordinationEventKind::PathConflict,
            cluster_mission_id,
            uav_id: path.uav_id.clone(),
            timestamp: ids::unix_secs(),
            data: serde_json::json!({
                "conflicts": conflicts,
                "replanned_waypoints": replanned.waypoints.len(),
            }),
        });
        Some((replanned, conflicts))
    }

    // -----------------------------------------------------------------
    // Target tracking
    // -----------------------------------------------------------------

    pub fn register_target(&self, target: TargetInfo) -> CoreResult<TargetInfo> {
        if target.target_id.trim().is_empty() {
            return Err(CoreError::Validation("target_id cannot be empty".into()));
        }
        if !(0.0..=1.0).contains(&target.confidence) {
            return Err(CoreError::Validation(format!(
                "confidence {} outside [0, 1]",
                target.confidence
            )));
        }
        let cluster_mission_id = self
            .get_state(&target.detected_by)
            .map(|s| s.cluster_mission_id)
            .unwrap_or_default();
        self.emit(CoordinationMessage {
            event: CoordinationEventKind::TargetFound,
            cluster_mission_id,
            uav_id: target.detected_by.clone(),
            timestamp: ids::unix_secs(),
            data: serde_json::to_value(&target).unwrap_or_default(),
        });
        self.targets.insert(target.target_id.clone(), target.clone());
        Ok(target)
    }

    pub fn list_targets(&self) -> Vec<TargetInfo> {
        let mut all: Vec<TargetInfo> = self.targets.iter().map(|t| t.clone()).collect();
        all.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        all
    }

    /// Periodic conflict sweep over every tracked vehicle.
    pub async fn run_conflict_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(
            crate::config::get().coordinator.conflict_check_interval_secs,
        );
        info!(interval_secs = interval.as_secs(), "Conflict check loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Conflict check loop stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    let ids: Vec<String> =
                        self.states.iter().map(|s| s.uav_id.clone()).collect();
                    for uav_id in ids {
                        self.check_conflicts(&uav_id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClusterMissionKind, SubMissionAssignment, UavCapabilities, UavStatus};

    fn area_at(lat: f64, lon: f64) -> Area {
        Area::new(
            vec![
                GeoPoint::new(lat, lon, 0.0),
                GeoPoint::new(lat + 0.01, lon, 0.0),
                GeoPoint::new(lat + 0.01, lon + 0.01, 0.0),
                GeoPoint::new(lat, lon + 0.01, 0.0),
            ],
            0.0,
            100.0,
        )
    }

    fn cluster(uavs: &[&str]) -> ClusterMission {
        ClusterMission {
            cluster_mission_id: "cm1".into(),
            name: "sweep".into(),
            kind: ClusterMissionKind::SearchRescue,
            area: area_at(0.0, 0.0),
            sub_missions: uavs
                .iter()
                .enumerate()
                .map(|(i, id)| SubMissionAssignment {
                    mission_id: format!("m{i}"),
                    uav_id: (*id).to_string(),
                    area: area_at(0.0, 0.0),
                })
                .collect(),
            created_at: 0,
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(50.0, 50.0)
    }

    #[test]
    fn test_register_creates_states() {
        let coord = coordinator();
        coord.register_cluster_mission(&cluster(&["u1", "u2"]));
        assert!(coord.get_state("u1").is_some());
        assert_eq!(coord.cluster_states("cm1").len(), 2);
    }

    #[test]
    fn test_conflict_detected_below_min_separation() {
        let coord = coordinator();
        coord.register_cluster_mission(&cluster(&["u1", "u2"]));

        // ~30 m apart.
        coord
            .update_state("u1", GeoPoint::new(0.0, 0.0, 50.0), None, None)
            .unwrap();
        let conflicts = coord
            .update_state("u2", GeoPoint::new(0.00027, 0.0, 50.0), None, None)
            .unwrap();

        assert_eq!(conflicts.len(), 1);
        let c = &conflicts[0];
        assert!(c.severity > 0.0);
        let pair = [c.uav_id_a.as_str(), c.uav_id_b.as_str()];
        assert!(pair.contains(&"u1") && pair.contains(&"u2"));
    }

    #[test]
    fn test_no_conflict_across_clusters() {
        let coord = coordinator();
        let mut a = cluster(&["u1"]);
        let mut b = cluster(&["u2"]);
        a.cluster_mission_id = "ca".into();
        b.cluster_mission_id = "cb".into();
        coord.register_cluster_mission(&a);
        coord.register_cluster_mission(&b);

        coord
            .update_state("u1", GeoPoint::new(0.0, 0.0, 50.0), None, None)
            .unwrap();
        let conflicts = coord
            .update_state("u2", GeoPoint::new(0.0001, 0.0, 50.0), None, None)
            .unwrap();
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_no_conflict_for_paused_peer() {
        let coord = coordinator();
        coord.register_cluster_mission(&cluster(&["u1", "u2"]));
        coord.handle_event(CoordinationMessage {
            event: CoordinationEventKind::MissionPaused,
            cluster_mission_id: "cm1".into(),
            uav_id: "u2".into(),
            timestamp: 0,
            data: serde_json::json!({}),
        });

        coord
            .update_state("u2", GeoPoint::new(0.0001, 0.0, 50.0), None, None)
            .unwrap();
        let conflicts = coord
            .update_state("u1", GeoPoint::new(0.0, 0.0, 50.0), None, None)
            .unwrap();
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_cluster_progress_aggregation() {
        let coord = coordinator();
        coord.register_cluster_mission(&cluster(&["u1", "u2", "u3"]));

        coord
            .update_state("u1", GeoPoint::new(0.0, 0.0, 50.0), Some(1.0), None)
            .unwrap();
        coord.handle_event(CoordinationMessage {
            event: CoordinationEventKind::MissionCompleted,
            cluster_mission_id: "cm1".into(),
            uav_id: "u1".into(),
            timestamp: 0,
            data: serde_json::json!({}),
        });
        coord
            .update_state("u2", GeoPoint::new(0.1, 0.0, 50.0), Some(0.5), None)
            .unwrap();
        coord.handle_event(CoordinationMessage {
            event: CoordinationEventKind::MissionFailed,
            cluster_mission_id: "cm1".into(),
            uav_id: "u3".into(),
            timestamp: 0,
            data: serde_json::json!({}),
        });

        let progress = coord.cluster_progress("cm1");
        assert_eq!(progress.uav_count, 3);
        assert_eq!(progress.completed_count, 1);
        assert_eq!(progress.running_count, 1);
        assert_eq!(progress.failed_count, 1);
        assert!((progress.total_progress - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_progress_event_is_monotone() {
        let coord = coordinator();
        coord.register_cluster_mission(&cluster(&["u1"]));
        coord
            .update_state("u1", GeoPoint::new(0.0, 0.0, 50.0), Some(0.6), None)
            .unwrap();
        // A stale lower report must not regress progress.
        coord
            .update_state("u1", GeoPoint::new(0.0, 0.0, 50.0), Some(0.3), None)
            .unwrap();
        assert!((coord.get_state("u1").unwrap().progress - 0.6).abs() < 1e-12);
    }

    fn healthy_uav(id: &str, battery: f64, workload: f64, lat: f64) -> Uav {
        let mut uav = Uav::new(
            id.into(),
            UavCapabilities {
                current_battery: battery,
                ..UavCapabilities::default()
            },
            serde_json::json!({}),
        );
        uav.workload = workload;
        uav.position = Some(GeoPoint::new(lat, 0.0, 0.0));
        uav
    }

    #[test]
    fn test_reassign_prefers_battery_idleness_proximity() {
        let coord = coordinator();
        coord.register_cluster_mission(&cluster(&["u1"]));

        let near_full = healthy_uav("near", 100.0, 0.0, 0.005);
        let far_weak = healthy_uav("far", 30.0, 0.8, 5.0);

        let moved = coord.reassign_from_failed("u1", &[far_weak, near_full]);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].to_uav, "near");
        assert!(coord.get_state("near").is_some());
        assert!(coord.get_state("u1").is_none());
    }

    #[test]
    fn test_reassign_skips_busy_candidates() {
        let coord = coordinator();
        coord.register_cluster_mission(&cluster(&["u1"]));

        let mut busy = healthy_uav("busy", 100.0, 0.0, 0.0);
        busy.status = UavStatus::Busy;
        busy.current_mission = Some("x".into());

        assert!(coord.reassign_from_failed("u1", &[busy]).is_empty());
    }

    #[test]
    fn test_load_balance_suggestion_over_gap() {
        let coord = coordinator();
        coord.register_cluster_mission(&cluster(&["u1"]));

        // u1 runs one mission (load 0.2); u2 idles with zero workload.
        let heavy = healthy_uav("u1", 100.0, 0.6, 0.0); // load 0.2 + 0.3 = 0.5
        let light = healthy_uav("u2", 100.0, 0.0, 0.0); // load 0.0

        let suggestions = coord.load_balance_suggestions(&[heavy, light]);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].from_uav, "u1");
        assert_eq!(suggestions[0].to_uav, "u2");
    }

    #[test]
    fn test_load_balance_quiet_under_gap() {
        let coord = coordinator();
        let a = healthy_uav("u1", 100.0, 0.1, 0.0);
        let b = healthy_uav("u2", 100.0, 0.0, 0.0);
        assert!(coord.load_balance_suggestions(&[a, b]).is_empty());
    }

    #[test]
    fn test_replan_detours_around_worst_conflict() {
        let coord = coordinator();
        let wp = |lat: f64, t: u64| Waypoint {
            position: GeoPoint::new(lat, 0.0, 50.0),
            timestamp: t,
            speed_mps: 10.0,
        };
        let mine = FlightPath {
            uav_id: "u1".into(),
            waypoints: vec![wp(0.0, 100), wp(0.001, 200)],
        };
        let theirs = FlightPath {
            uav_id: "u2".into(),
            waypoints: vec![wp(0.00105, 200)], // ~5 m from my second waypoint
        };

        let (replanned, conflicts) = coord
            .replan_conflicting_path(&mine, &[theirs])
            .expect("conflicting path must replan");
        assert!(!conflicts.is_empty());
        // The detour shifts the conflicting waypoint sideways.
        assert!(replanned.waypoints[1].position.lon > 0.0);

        // A clear path needs no replanning.
        let clear = FlightPath {
            uav_id: "u1".into(),
            waypoints: vec![wp(0.5, 100)],
        };
        assert!(coord.replan_conflicting_path(&clear, &[]).is_none());
    }

    #[test]
    fn test_target_registration_validates() {
        let coord = coordinator();
        let target = TargetInfo {
            target_id: "t1".into(),
            position: GeoPoint::new(0.0, 0.0, 0.0),
            detected_by: "u1".into(),
            detected_at: 100,
            confidence: 0.9,
            target_type: "PERSON".into(),
            metadata: serde_json::json!({}),
        };
        coord.register_target(target.clone()).unwrap();
        assert_eq!(coord.list_targets().len(), 1);

        let mut bad = target;
        bad.target_id = "t2".into();
        bad.confidence = 1.5;
        assert!(coord.register_target(bad).is_err());
    }
}
