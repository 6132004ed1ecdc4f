//! UAV registry records: status, capabilities, heartbeat bookkeeping.

use super::geo::GeoPoint;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UavStatus {
    Online,
    Offline,
    Busy,
    Idle,
    Error,
}

impl UavStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Busy => "BUSY",
            Self::Idle => "IDLE",
            Self::Error => "ERROR",
        }
    }
}

/// Static airframe capabilities plus the live battery reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UavCapabilities {
    #[serde(default = "default_max_altitude")]
    pub max_altitude_m: f64,
    #[serde(default = "default_max_speed")]
    pub max_speed_mps: f64,
    #[serde(default = "default_battery")]
    pub battery_capacity: f64,
    #[serde(default = "default_battery")]
    pub current_battery: f64,
    #[serde(default)]
    pub max_payload_kg: f64,
}

fn default_max_altitude() -> f64 {
    100.0
}
fn default_max_speed() -> f64 {
    15.0
}
fn default_battery() -> f64 {
    100.0
}

impl Default for UavCapabilities {
    fn default() -> Self {
        Self {
            max_altitude_m: default_max_altitude(),
            max_speed_mps: default_max_speed(),
            battery_capacity: default_battery(),
            current_battery: default_battery(),
            max_payload_kg: 0.0,
        }
    }
}

impl UavCapabilities {
    /// Remaining charge as a fraction of capacity, clamped to [0, 1].
    pub fn battery_ratio(&self) -> f64 {
        if self.battery_capacity <= 0.0 {
            return 0.0;
        }
        (self.current_battery / self.battery_capacity).clamp(0.0, 1.0)
    }
}

/// A registered vehicle.
///
/// Invariant: `current_mission` is `None` iff `status` is ONLINE or IDLE,
/// and BUSY implies a bound mission. The fleet inventory enforces this on
/// every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Uav {
    pub uav_id: String,
    pub status: UavStatus,
    /// Unix seconds of the last heartbeat or accepted telemetry message.
    pub last_heartbeat: u64,
    pub current_mission: Option<String>,
    pub capabilities: UavCapabilities,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Last reported position, if any telemetry has arrived.
    #[serde(default)]
    pub position: Option<GeoPoint>,
    /// Coordinator-maintained load fraction in [0, 1].
    #[serde(default)]
    pub workload: f64,
}

impl Uav {
    pub fn new(uav_id: String, capabilities: UavCapabilities, metadata: serde_json::Value) -> Self {
        Self {
            uav_id,
            status: UavStatus::Online,
            last_heartbeat: crate::ids::unix_secs(),
            current_mission: None,
            capabilities,
            metadata,
            position: None,
            workload: 0.0,
        }
    }

    /// Dispatchable: mission-free and not offline or errored.
    pub fn is_available(&self) -> bool {
        matches!(self.status, UavStatus::Online | UavStatus::Idle) && self.current_mission.is_none()
    }
}
