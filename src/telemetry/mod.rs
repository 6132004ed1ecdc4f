//! Telemetry ingress: validation, change detection, heartbeat side effect.
//!
//! Every accepted message refreshes the vehicle's heartbeat and position in
//! the fleet inventory. Only *significant* changes are forwarded to the
//! viewer broadcast pipeline; insignificant updates still refresh the
//! internal state table for queries.

use crate::error::{CoreError, CoreResult};
use crate::fleet::FleetInventory;
use crate::ids;
use crate::types::{GeoPoint, TelemetryMessage};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Position delta (degrees) below which a move is insignificant.
const POSITION_THRESHOLD_DEG: f64 = 0.001;
/// Altitude delta (meters) below which a climb is insignificant.
const ALTITUDE_THRESHOLD_M: f64 = 1.0;
/// Battery delta (percentage points) below which a drain is insignificant.
const BATTERY_THRESHOLD_PCT: f64 = 1.0;

#[derive(Debug, Default, serde::Serialize)]
pub struct TelemetryStats {
    pub accepted: u64,
    pub rejected: u64,
    pub broadcast: u64,
}

pub struct TelemetryService {
    fleet: Arc<FleetInventory>,
    /// Latest accepted message per vehicle.
    states: DashMap<String, TelemetryMessage>,
    /// Last message that was considered significant per vehicle.
    last_broadcast: DashMap<String, TelemetryMessage>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    broadcast: AtomicU64,
}

impl TelemetryService {
    pub fn new(fleet: Arc<FleetInventory>) -> Self {
        Self {
            fleet,
            states: DashMap::new(),
            last_broadcast: DashMap::new(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            broadcast: AtomicU64::new(0),
        }
    }

    /// Validate and ingest one message.
    ///
    /// Returns `Some(message)` when the update is significant and should be
    /// broadcast, `None` when it only refreshed internal state.
    pub fn ingest(&self, msg: TelemetryMessage) -> CoreResult<Option<TelemetryMessage>> {
        if let Err(e) = msg.validate(ids::unix_millis()) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);

        // Heartbeat side effect. Telemetry from an unregistered (or
        // removed) vehicle still updates nothing in the registry.
        match self.fleet.heartbeat(&msg.uav_id) {
            Ok(()) => {
                let position = GeoPoint::new(msg.position.lat, msg.position.lon, msg.position.alt);
                self.fleet
                    .update_observation(&msg.uav_id, position, msg.battery.percent)?;
            }
            Err(CoreError::NotFound(_)) => {
                debug!(uav_id = %msg.uav_id, "Telemetry from unregistered UAV");
            }
            Err(e) => return Err(e),
        }

        let significant = self
            .last_broadcast
            .get(&msg.uav_id)
            .map_or(true, |last| is_significant_change(&last, &msg));

        self.states.insert(msg.uav_id.clone(), msg.clone());
        if significant {
            self.last_broadcast.insert(msg.uav_id.clone(), msg.clone());
            self.broadcast.fetch_add(1, Ordering::Relaxed);
            Ok(Some(msg))
        } else {
            Ok(None)
        }
    }

    pub fn state_of(&self, uav_id: &str) -> Option<TelemetryMessage> {
        self.states.get(uav_id).map(|m| m.clone())
    }

    pub fn all_states(&self) -> Vec<TelemetryMessage> {
        let mut all: Vec<TelemetryMessage> = self.states.iter().map(|m| m.clone()).collect();
        all.sort_by(|a, b| a.uav_id.cmp(&b.uav_id));
        all
    }

    pub fn clear_state(&self, uav_id: &str) {
        self.states.remove(uav_id);
        self.last_broadcast.remove(uav_id);
    }

    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            broadcast: self.broadcast.load(Ordering::Relaxed),
        }
    }
}

/// A change is significant when any of: position moved past the threshold,
/// altitude changed more than a meter, battery moved a full point, the
/// flight mode changed, or the GPS fix type changed.
fn is_significant_change(last: &TelemetryMessage, current: &TelemetryMessage) -> bool {
    (last.position.lat - current.position.lat).abs() > POSITION_THRESHOLD_DEG
        || (last.position.lon - current.position.lon).abs() > POSITION_THRESHOLD_DEG
        || (last.position.alt - current.position.alt).abs() > ALTITUDE_THRESHOLD_M
        || (last.battery.percent - current.battery.percent).abs() > BATTERY_THRESHOLD_PCT
        || last.flight_mode != current.flight_mode
        || last.gps.fix_type != current.gps.fix_type
}
