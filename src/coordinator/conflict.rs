//! Conflict detection, path replanning, and dynamic obstacle avoidance.
//!
//! All geometry is spherical-Earth Haversine plus the flat-Earth degree
//! conversion (1° ≈ 111 km, longitude scaled by cos latitude) for small
//! lateral offsets.

use crate::types::{haversine_m, GeoPoint, METERS_PER_DEGREE};
use serde::{Deserialize, Serialize};

/// Time window over which two close waypoints count as fully severe.
const SEVERITY_WINDOW_SECS: f64 = 10.0;

/// Lookahead horizon for obstacle prediction.
const PREDICTION_HORIZON_SECS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub position: GeoPoint,
    /// Unix seconds at which the vehicle is expected here.
    pub timestamp: u64,
    pub speed_mps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightPath {
    pub uav_id: String,
    pub waypoints: Vec<Waypoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    Position,
    Path,
    Predicted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub uav_id_a: String,
    pub uav_id_b: String,
    pub kind: ConflictKind,
    pub point: GeoPoint,
    /// Unix seconds of the conflicting instant.
    pub time: u64,
    /// 0.0 (barely) .. 1.0 (simultaneous).
    pub severity: f64,
}

/// Severity of two objects `distance` apart whose timestamps differ by
/// `dt` seconds: closer in time is worse.
pub fn conflict_severity(dt_secs: f64) -> f64 {
    1.0 - (dt_secs.abs() / SEVERITY_WINDOW_SECS).min(1.0)
}

/// Pairwise waypoint sweep of one path against the others.
pub fn detect_path_conflicts(
    path: &FlightPath,
    others: &[FlightPath],
    min_separation_m: f64,
) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for other in others {
        if other.uav_id == path.uav_id {
            continue;
        }
        for wp in &path.waypoints {
            for other_wp in &other.waypoints {
                let distance = haversine_m(&wp.position, &other_wp.position);
                if distance < min_separation_m {
                    let dt = wp.timestamp.abs_diff(other_wp.timestamp) as f64;
                    conflicts.push(Conflict {
                        uav_id_a: path.uav_id.clone(),
                        uav_id_b: other.uav_id.clone(),
                        kind: ConflictKind::Path,
                        point: wp.position,
                        time: wp.timestamp,
                        severity: conflict_severity(dt),
                    });
                }
            }
        }
    }
    conflicts
}

/// Replan a conflicting path: keep waypoints strictly before the conflict
/// time, then push every later waypoint sideways by 1.5x the minimum
/// separation.
pub fn replan_path(path: &FlightPath, conflict: &Conflict, min_separation_m: f64) -> FlightPath {
    let split = path
        .waypoints
        .iter()
        .position(|wp| wp.timestamp >= conflict.time)
        .unwrap_or(0);

    let offset_m = min_separation_m * 1.5;
    let mut waypoints: Vec<Waypoint> = path.waypoints[..split].to_vec();
    for wp in &path.waypoints[split..] {
        let lat_offset = offset_m / METERS_PER_DEGREE;
        let lon_offset = offset_m / (METERS_PER_DEGREE * wp.position.lat.to_radians().cos());
        waypoints.push(Waypoint {
            position: GeoPoint::new(
                wp.position.lat + lat_offset,
                wp.position.lon + lon_offset,
                wp.position.alt,
            ),
            timestamp: wp.timestamp,
            speed_mps: wp.speed_mps,
        });
    }

    FlightPath {
        uav_id: path.uav_id.clone(),
        waypoints,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Obstacle {
    pub position: GeoPoint,
    pub radius_m: f64,
}

/// Velocity in degrees-per-second latitude/longitude plus meters-per-second
/// vertically.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Velocity {
    pub lat_per_sec: f64,
    pub lon_per_sec: f64,
    pub alt_per_sec: f64,
}

/// Constant-velocity position prediction.
pub fn predict_position(position: &GeoPoint, velocity: &Velocity, dt_secs: f64) -> GeoPoint {
    GeoPoint::new(
        position.lat + velocity.lat_per_sec * dt_secs,
        position.lon + velocity.lon_per_sec * dt_secs,
        position.alt + velocity.alt_per_sec * dt_secs,
    )
}

/// Check obstacles against the five-second prediction. When one falls
/// inside twice the avoidance radius, return a waypoint on the ray from
/// the obstacle through the current position, twice the radius out.
pub fn avoidance_waypoint(
    position: &GeoPoint,
    velocity: &Velocity,
    obstacles: &[Obstacle],
    avoidance_radius_m: f64,
) -> Option<GeoPoint> {
    let predicted = predict_position(position, velocity, PREDICTION_HORIZON_SECS);
    let threat_radius = avoidance_radius_m * 2.0;

    for obstacle in obstacles {
        if haversine_m(&predicted, &obstacle.position) < threat_radius {
            let lat_diff = position.lat - obstacle.position.lat;
            let lon_diff = position.lon - obstacle.position.lon;
            let mut norm = lat_diff.hypot(lon_diff);
            if norm == 0.0 {
                norm = 0.001;
            }

            let lat_offset = (lat_diff / norm) * threat_radius / METERS_PER_DEGREE;
            let lon_offset = (lon_diff / norm) * threat_radius
                / (METERS_PER_DEGREE * position.lat.to_radians().cos());

            return Some(GeoPoint::new(
                position.lat + lat_offset,
                position.lon + lon_offset,
                position.alt,
            ));
        }
    }
    None
}
