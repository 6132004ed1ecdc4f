//! Fleet inventory — registry of UAVs with status, heartbeat, capabilities.
//!
//! The in-memory table is a derived view over the `uav/` keyspace and is
//! rebuilt from the repository on startup. Every mutation writes through.
//!
//! A background liveness scan marks vehicles OFFLINE once their heartbeat
//! goes stale and reports any mission bound to a failed vehicle so the
//! coordinator can reassign it.

mod clusters;

pub use clusters::{ClusterInfo, ClusterMember, ClusterRegistry, ClusterRole};

use crate::error::{CoreError, CoreResult};
use crate::ids;
use crate::storage::{keys, Repository, RepositoryExt};
use crate::types::{EntityChange, EntityKind, GeoPoint, SyncOpKind, Uav, UavCapabilities, UavStatus};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A vehicle that went offline while bound to a mission.
#[derive(Debug, Clone)]
pub struct UavFailure {
    pub uav_id: String,
    pub mission_id: Option<String>,
}

pub struct FleetInventory {
    repo: Arc<dyn Repository>,
    uavs: DashMap<String, Uav>,
    changes: broadcast::Sender<EntityChange>,
}

impl FleetInventory {
    /// Open the inventory, rebuilding the in-memory table from the store.
    pub fn open(repo: Arc<dyn Repository>) -> CoreResult<Self> {
        let uavs = DashMap::new();
        for (_, uav) in repo.scan_json::<Uav>("uav/")? {
            uavs.insert(uav.uav_id.clone(), uav);
        }
        if !uavs.is_empty() {
            info!(count = uavs.len(), "Fleet inventory restored from store");
        }
        let (changes, _) = broadcast::channel(256);
        Ok(Self { repo, uavs, changes })
    }

    /// Stream of local mutations for the replication layer.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<EntityChange> {
        self.changes.subscribe()
    }

    fn notify(&self, op: SyncOpKind, uav_id: &str) {
        let _ = self.changes.send(EntityChange {
            op,
            entity: EntityKind::Uav,
            entity_id: uav_id.to_string(),
        });
    }

    fn persist(&self, uav: &Uav) -> CoreResult<()> {
        self.repo.put_json(&keys::uav(&uav.uav_id), uav)
    }

    /// Idempotent registration: inserts a new vehicle or refreshes the
    /// capabilities and metadata of a known one. A re-registration never
    /// loses the current mission binding.
    pub fn register(
        &self,
        uav_id: &str,
        capabilities: UavCapabilities,
        metadata: serde_json::Value,
    ) -> CoreResult<Uav> {
        if uav_id.trim().is_empty() {
            return Err(CoreError::Validation("uav_id cannot be empty".into()));
        }

        let uav = match self.uavs.get_mut(uav_id) {
            Some(mut existing) => {
                existing.capabilities = capabilities;
                existing.metadata = metadata;
                existing.last_heartbeat = ids::unix_secs();
                if existing.status == UavStatus::Offline {
                    existing.status = if existing.current_mission.is_some() {
                        UavStatus::Busy
                    } else {
                        UavStatus::Online
                    };
                }
                existing.clone()
            }
            None => {
                let uav = Uav::new(uav_id.to_string(), capabilities, metadata);
                self.uavs.insert(uav_id.to_string(), uav.clone());
                info!(uav_id = %uav_id, "UAV registered");
                uav
            }
        };
        self.persist(&uav)?;
        self.notify(SyncOpKind::Create, uav_id);
        Ok(uav)
    }

    /// Record a heartbeat. An OFFLINE vehicle seen again comes back ONLINE
    /// (or BUSY when it still holds a mission).
    pub fn heartbeat(&self, uav_id: &str) -> CoreResult<()> {
        let mut entry = self
            .uavs
            .get_mut(uav_id)
            .ok_or_else(|| CoreError::NotFound(format!("uav {uav_id}")))?;
        entry.last_heartbeat = ids::unix_secs();
        if entry.status == UavStatus::Offline {
            entry.status = if entry.current_mission.is_some() {
                UavStatus::Busy
            } else {
                UavStatus::Online
            };
            debug!(uav_id = %uav_id, "UAV back online");
        }
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot)
    }

    /// Explicit status transition used by the scheduler and coordinator.
    ///
    /// Enforces the registry invariant: BUSY requires a mission binding,
    /// and a mission-free status clears it.
    pub fn set_status(
        &self,
        uav_id: &str,
        status: UavStatus,
        mission_id: Option<String>,
    ) -> CoreResult<()> {
        let mut entry = self
            .uavs
            .get_mut(uav_id)
            .ok_or_else(|| CoreError::NotFound(format!("uav {uav_id}")))?;

        if status == UavStatus::Busy && mission_id.is_none() {
            return Err(CoreError::InvalidState(format!(
                "uav {uav_id}: BUSY requires a mission id"
            )));
        }

        entry.status = status;
        entry.current_mission = match status {
            UavStatus::Busy => mission_id,
            UavStatus::Online | UavStatus::Idle => None,
            // Offline / Error keep the binding so the mission can be reassigned.
            UavStatus::Offline | UavStatus::Error => entry.current_mission.take().or(mission_id),
        };
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot)?;
        self.notify(SyncOpKind::Update, uav_id);
        Ok(())
    }

    /// Atomically bind a set of vehicles to a mission, flipping them BUSY.
    ///
    /// All-or-nothing: if any vehicle is not available the whole bind rolls
    /// back and nothing changes.
    pub fn bind_mission(&self, uav_ids: &[String], mission_id: &str) -> CoreResult<()> {
        let mut bound: Vec<String> = Vec::with_capacity(uav_ids.len());
        for uav_id in uav_ids {
            let ok = match self.uavs.get_mut(uav_id) {
                Some(mut entry) if entry.is_available() => {
                    entry.status = UavStatus::Busy;
                    entry.current_mission = Some(mission_id.to_string());
                    true
                }
                _ => false,
            };
            if ok {
                bound.push(uav_id.clone());
            } else {
                // Roll back everything bound so far.
                for prev in &bound {
                    if let Some(mut entry) = self.uavs.get_mut(prev) {
                        entry.status = UavStatus::Online;
                        entry.current_mission = None;
                    }
                }
                return Err(CoreError::CapacityExhausted(format!(
                    "uav {uav_id} is not available for mission {mission_id}"
                )));
            }
        }
        for uav_id in &bound {
            if let Some(entry) = self.uavs.get(uav_id) {
                self.persist(&entry)?;
            }
            self.notify(SyncOpKind::Update, uav_id);
        }
        Ok(())
    }

    /// Drop a vehicle's mission binding without touching its status.
    /// Used after the coordinator moves a mission off a failed vehicle.
    pub fn clear_binding(&self, uav_id: &str) -> CoreResult<()> {
        let mut entry = self
            .uavs
            .get_mut(uav_id)
            .ok_or_else(|| CoreError::NotFound(format!("uav {uav_id}")))?;
        entry.current_mission = None;
        if entry.status == UavStatus::Busy {
            entry.status = UavStatus::Idle;
        }
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot)?;
        self.notify(SyncOpKind::Update, uav_id);
        Ok(())
    }

    /// Release every vehicle bound to the mission back to IDLE.
    pub fn release_mission(&self, mission_id: &str) -> CoreResult<Vec<String>> {
        let mut released = Vec::new();
        for mut entry in self.uavs.iter_mut() {
            if entry.current_mission.as_deref() == Some(mission_id) {
                entry.status = UavStatus::Idle;
                entry.current_mission = None;
                released.push(entry.uav_id.clone());
            }
        }
        for uav_id in &released {
            if let Some(entry) = self.uavs.get(uav_id) {
                self.persist(&entry)?;
            }
            self.notify(SyncOpKind::Update, uav_id);
        }
        Ok(released)
    }

    /// Position/battery refresh driven by accepted telemetry.
    pub fn update_observation(
        &self,
        uav_id: &str,
        position: GeoPoint,
        battery_percent: f64,
    ) -> CoreResult<()> {
        let mut entry = self
            .uavs
            .get_mut(uav_id)
            .ok_or_else(|| CoreError::NotFound(format!("uav {uav_id}")))?;
        entry.position = Some(position);
        let capacity = entry.capabilities.battery_capacity;
        entry.capabilities.current_battery = battery_percent / 100.0 * capacity;
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot)
    }

    pub fn set_workload(&self, uav_id: &str, workload: f64) {
        if let Some(mut entry) = self.uavs.get_mut(uav_id) {
            entry.workload = workload.clamp(0.0, 1.0);
        }
    }

    pub fn get(&self, uav_id: &str) -> Option<Uav> {
        self.uavs.get(uav_id).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<Uav> {
        let mut all: Vec<Uav> = self.uavs.iter().map(|e| e.clone()).collect();
        all.sort_by(|a, b| a.uav_id.cmp(&b.uav_id));
        all
    }

    /// Mission-free vehicles eligible for dispatch.
    pub fn available_uavs(&self) -> Vec<Uav> {
        let mut free: Vec<Uav> = self
            .uavs
            .iter()
            .filter(|e| e.is_available())
            .map(|e| e.clone())
            .collect();
        free.sort_by(|a, b| a.uav_id.cmp(&b.uav_id));
        free
    }

    /// Explicit removal ends the vehicle lifecycle. Heartbeats after
    /// removal are rejected as NotFound and ignored by callers.
    pub fn remove(&self, uav_id: &str) -> CoreResult<()> {
        self.uavs
            .remove(uav_id)
            .ok_or_else(|| CoreError::NotFound(format!("uav {uav_id}")))?;
        self.repo.delete(&keys::uav(uav_id))?;
        self.notify(SyncOpKind::Delete, uav_id);
        Ok(())
    }

    /// Apply a replicated UAV record from a peer without re-announcing it.
    pub fn apply_replicated(&self, uav: Uav) -> CoreResult<()> {
        self.persist(&uav)?;
        self.uavs.insert(uav.uav_id.clone(), uav);
        Ok(())
    }

    /// Apply a replicated removal from a peer without re-announcing it.
    pub fn remove_replicated(&self, uav_id: &str) -> CoreResult<()> {
        self.uavs.remove(uav_id);
        self.repo.delete(&keys::uav(uav_id))
    }

    /// One liveness pass: mark stale vehicles OFFLINE and collect the
    /// missions that lost their vehicle.
    pub fn scan_liveness(&self, now_secs: u64, offline_threshold: Duration) -> Vec<UavFailure> {
        let threshold = offline_threshold.as_secs();
        let mut failures = Vec::new();

        for mut entry in self.uavs.iter_mut() {
            if matches!(entry.status, UavStatus::Offline) {
                continue;
            }
            if now_secs.saturating_sub(entry.last_heartbeat) > threshold {
                warn!(
                    uav_id = %entry.uav_id,
                    last_heartbeat = entry.last_heartbeat,
                    "UAV heartbeat stale, marking OFFLINE"
                );
                entry.status = UavStatus::Offline;
                failures.push(UavFailure {
                    uav_id: entry.uav_id.clone(),
                    mission_id: entry.current_mission.clone(),
                });
            }
        }
        for failure in &failures {
            if let Some(entry) = self.uavs.get(&failure.uav_id) {
                let _ = self.persist(&entry);
            }
        }
        failures
    }

    /// Background liveness loop. Failures with a bound mission are pushed
    /// to the coordinator through `failures_tx`.
    pub async fn run_liveness_loop(
        self: Arc<Self>,
        failures_tx: mpsc::Sender<UavFailure>,
        cancel: CancellationToken,
    ) {
        let cfg = crate::config::get();
        let interval = Duration::from_secs(cfg.fleet.liveness_scan_interval_secs);
        let threshold = Duration::from_secs(cfg.fleet.offline_threshold_secs);

        info!(
            interval_secs = interval.as_secs(),
            threshold_secs = threshold.as_secs(),
            "Liveness scan started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Liveness scan stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    for failure in self.scan_liveness(ids::unix_secs(), threshold) {
                        if failure.mission_id.is_some() {
                            if failures_tx.send(failure).await.is_err() {
                                warn!("Failure channel closed, stopping liveness scan");
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}
