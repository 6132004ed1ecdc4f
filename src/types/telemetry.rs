//! Telemetry wire format and ingress validation.
//!
//! Field ranges follow the vehicle link contract: coordinates on the WGS84
//! interval, altitude within [-1000, 50000] m, GPS fix type 0-6, and a
//! timestamp that is neither in the future nor older than one hour.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Maximum accepted telemetry age in milliseconds (1 hour).
pub const MAX_TELEMETRY_AGE_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPosition {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryAttitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryVelocity {
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBattery {
    pub percent: f64,
    pub voltage_mv: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryGps {
    /// 0 = no fix .. 6 = RTK fixed.
    pub fix_type: u8,
    pub num_sat: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub uav_id: String,
    /// Milliseconds since the Unix epoch, vehicle clock.
    pub timestamp_ms: u64,
    pub position: TelemetryPosition,
    pub attitude: TelemetryAttitude,
    pub velocity: TelemetryVelocity,
    pub battery: TelemetryBattery,
    pub gps: TelemetryGps,
    /// 0-100.
    pub link_quality: u8,
    pub flight_mode: String,
}

impl TelemetryMessage {
    /// Validate every field range. Any violation rejects the whole message.
    pub fn validate(&self, now_ms: u64) -> CoreResult<()> {
        if self.uav_id.trim().is_empty() {
            return Err(CoreError::Validation("uav_id cannot be empty".into()));
        }
        if !(-90.0..=90.0).contains(&self.position.lat) {
            return Err(CoreError::Validation(format!(
                "latitude {} outside [-90, 90]",
                self.position.lat
            )));
        }
        if !(-180.0..=180.0).contains(&self.position.lon) {
            return Err(CoreError::Validation(format!(
                "longitude {} outside [-180, 180]",
                self.position.lon
            )));
        }
        if !(-1000.0..=50_000.0).contains(&self.position.alt) {
            return Err(CoreError::Validation(format!(
                "altitude {} outside [-1000, 50000] m",
                self.position.alt
            )));
        }
        for (name, v) in [
            ("roll", self.attitude.roll),
            ("pitch", self.attitude.pitch),
            ("yaw", self.attitude.yaw),
        ] {
            if !(-std::f64::consts::PI..=std::f64::consts::PI).contains(&v) {
                return Err(CoreError::Validation(format!(
                    "{name} {v} outside [-pi, pi] radians"
                )));
            }
        }
        for (name, v) in [
            ("vx", self.velocity.vx),
            ("vy", self.velocity.vy),
            ("vz", self.velocity.vz),
        ] {
            if v.abs() > 100.0 {
                return Err(CoreError::Validation(format!(
                    "{name} {v} outside [-100, 100] m/s"
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.battery.percent) {
            return Err(CoreError::Validation(format!(
                "battery percent {} outside [0, 100]",
                self.battery.percent
            )));
        }
        if self.gps.fix_type > 6 {
            return Err(CoreError::Validation(format!(
                "gps fix type {} outside [0, 6]",
                self.gps.fix_type
            )));
        }
        if self.link_quality > 100 {
            return Err(CoreError::Validation(format!(
                "link quality {} outside [0, 100]",
                self.link_quality
            )));
        }
        if self.flight_mode.trim().is_empty() {
            return Err(CoreError::Validation("flight_mode cannot be empty".into()));
        }
        if self.timestamp_ms > now_ms {
            return Err(CoreError::Validation(format!(
                "timestamp {} is in the future (now {})",
                self.timestamp_ms, now_ms
            )));
        }
        if now_ms - self.timestamp_ms > MAX_TELEMETRY_AGE_MS {
            return Err(CoreError::Validation(format!(
                "timestamp {} older than 1 hour",
                self.timestamp_ms
            )));
        }
        Ok(())
    }
}
