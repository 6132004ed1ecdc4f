//! Coordination events exchanged between cooperating vehicles and the
//! coordinator.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinationEventKind {
    MissionStarted,
    MissionPaused,
    MissionResumed,
    MissionCompleted,
    MissionFailed,
    AreaCovered,
    TargetFound,
    LowBattery,
    CollisionRisk,
    PathConflict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationMessage {
    pub event: CoordinationEventKind,
    pub cluster_mission_id: String,
    pub uav_id: String,
    /// Unix seconds.
    pub timestamp: u64,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_form() {
        let s = serde_json::to_string(&CoordinationEventKind::CollisionRisk).unwrap();
        assert_eq!(s, "\"COLLISION_RISK\"");
        let back: CoordinationEventKind = serde_json::from_str("\"AREA_COVERED\"").unwrap();
        assert_eq!(back, CoordinationEventKind::AreaCovered);
    }
}
