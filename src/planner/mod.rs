//! Mission planning: polygon decomposition and UAV selection.

pub mod assigner;
pub mod splitter;

pub use assigner::{AssignStrategy, Candidate, Constraint, Objective, ObjectiveKind};
pub use splitter::{split_area, SplitMethod, UavPlanInfo};

use crate::types::Uav;

/// Planner view of a vehicle, derived from the registry record.
impl From<&Uav> for UavPlanInfo {
    fn from(uav: &Uav) -> Self {
        Self {
            uav_id: uav.uav_id.clone(),
            position: uav.position,
            battery_ratio: uav.capabilities.battery_ratio(),
            workload: uav.workload,
        }
    }
}

impl From<&Uav> for Candidate {
    fn from(uav: &Uav) -> Self {
        Self {
            uav_id: uav.uav_id.clone(),
            max_altitude_m: uav.capabilities.max_altitude_m,
            max_speed_mps: uav.capabilities.max_speed_mps,
            battery_ratio: uav.capabilities.battery_ratio(),
            max_payload_kg: uav.capabilities.max_payload_kg,
            position: uav.position,
            workload: uav.workload,
        }
    }
}
