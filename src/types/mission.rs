//! Mission records and the lifecycle state machine.

use super::geo::Area;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionState {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl MissionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Directed edges of the lifecycle state machine. Anything not listed
    /// here is rejected with `INVALID_STATE`.
    pub fn can_transition(self, to: Self) -> bool {
        use MissionState::{Cancelled, Failed, Paused, Pending, Running, Succeeded};
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Paused)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionKind {
    SingleUav,
    MultiUav,
    Cluster,
}

/// Mission-type flavours used for retry tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionProfile {
    Search,
    Patrol,
    Transport,
    Inspection,
    Other,
}

impl Default for MissionProfile {
    fn default() -> Self {
        Self::Other
    }
}

/// What to do when fewer UAVs are available than requested at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallPolicy {
    /// Reject the dispatch with CAPACITY_EXHAUSTED.
    Fail,
    /// Proceed with `min(available, requested)` vehicles.
    Downgrade,
}

impl Default for ShortfallPolicy {
    fn default() -> Self {
        Self::Fail
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub mission_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: MissionKind,
    #[serde(default)]
    pub profile: MissionProfile,
    /// Assigned vehicles; may be empty until dispatch.
    #[serde(default)]
    pub uav_list: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    pub state: MissionState,
    pub progress: f64,
    #[serde(default)]
    pub area: Option<Area>,
    /// Requested vehicle count for MULTI_UAV / CLUSTER dispatch.
    #[serde(default)]
    pub requested_uavs: usize,
    #[serde(default)]
    pub on_shortfall: ShortfallPolicy,
    /// Set on retry attempts: the failed mission this one re-runs.
    #[serde(default)]
    pub retry_of: Option<String>,
    /// Unix seconds.
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<u64>,
}

impl Mission {
    /// Apply a state transition, enforcing the lifecycle edges.
    pub fn transition(&mut self, to: MissionState, now: u64) -> CoreResult<()> {
        if !self.state.can_transition(to) {
            return Err(CoreError::InvalidState(format!(
                "mission {} cannot go {} -> {}",
                self.mission_id,
                self.state.as_str(),
                to.as_str()
            )));
        }
        if to == MissionState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// Progress is monotonically non-decreasing while the mission is live.
    pub fn update_progress(&mut self, progress: f64, now: u64) -> CoreResult<()> {
        if !matches!(self.state, MissionState::Running | MissionState::Paused) {
            return Err(CoreError::InvalidState(format!(
                "mission {} is {}; progress updates require RUNNING or PAUSED",
                self.mission_id,
                self.state.as_str()
            )));
        }
        if !(0.0..=1.0).contains(&progress) {
            return Err(CoreError::Validation(format!(
                "progress {progress} outside [0, 1]"
            )));
        }
        if progress < self.progress {
            return Err(CoreError::Validation(format!(
                "progress may not decrease ({} -> {})",
                self.progress, progress
            )));
        }
        self.progress = progress;
        self.updated_at = now;
        Ok(())
    }
}

/// Mission flavour of a cluster operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterMissionKind {
    SearchRescue,
    AgriSpraying,
    Mapping,
    Patrol,
}

/// One sub-mission of a cluster mission: a vehicle bound to a sub-area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubMissionAssignment {
    pub mission_id: String,
    pub uav_id: String,
    pub area: Area,
}

/// A mission split into per-UAV sub-missions over a shared polygon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMission {
    pub cluster_mission_id: String,
    pub name: String,
    pub kind: ClusterMissionKind,
    pub area: Area,
    /// Ordered sub-mission assignments; each sub-mission belongs to exactly
    /// one cluster mission.
    pub sub_missions: Vec<SubMissionAssignment>,
    pub created_at: u64,
}

/// Lifecycle journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionEventKind {
    Created,
    Dispatched,
    Paused,
    Resumed,
    Cancelled,
    Deleted,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionEvent {
    pub mission_id: String,
    pub event: MissionEventKind,
    pub timestamp: u64,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mission(state: MissionState) -> Mission {
        Mission {
            mission_id: "m1".into(),
            name: "test".into(),
            description: String::new(),
            kind: MissionKind::SingleUav,
            profile: MissionProfile::Other,
            uav_list: vec![],
            payload: serde_json::json!({}),
            priority: 0,
            state,
            progress: 0.0,
            area: None,
            requested_uavs: 1,
            on_shortfall: ShortfallPolicy::Fail,
            retry_of: None,
            created_at: 100,
            updated_at: 100,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_permitted_edges() {
        use MissionState::*;
        let permitted = [
            (Pending, Running),
            (Pending, Cancelled),
            (Pending, Failed),
            (Running, Paused),
            (Running, Succeeded),
            (Running, Failed),
            (Running, Cancelled),
            (Paused, Running),
            (Paused, Cancelled),
        ];
        let all = [Pending, Running, Paused, Succeeded, Failed, Cancelled];
        for from in all {
            for to in all {
                let expected = permitted.contains(&(from, to));
                assert_eq!(
                    from.can_transition(to),
                    expected,
                    "{} -> {}",
                    from.as_str(),
                    to.as_str()
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_absorb() {
        use MissionState::*;
        for terminal in [Succeeded, Failed, Cancelled] {
            let mut m = mission(terminal);
            for to in [Pending, Running, Paused, Succeeded, Failed, Cancelled] {
                assert!(m.transition(to, 200).is_err());
            }
        }
    }

    #[test]
    fn test_started_at_set_once() {
        let mut m = mission(MissionState::Pending);
        m.transition(MissionState::Running, 150).unwrap();
        assert_eq!(m.started_at, Some(150));

        m.transition(MissionState::Paused, 160).unwrap();
        m.transition(MissionState::Running, 170).unwrap();
        assert_eq!(m.started_at, Some(150), "started_at must not move on resume");
    }

    #[test]
    fn test_completed_at_on_terminal() {
        let mut m = mission(MissionState::Running);
        m.started_at = Some(150);
        m.transition(MissionState::Succeeded, 300).unwrap();
        assert_eq!(m.completed_at, Some(300));
    }

    #[test]
    fn test_progress_monotonicity() {
        let mut m = mission(MissionState::Running);
        m.update_progress(0.5, 200).unwrap();
        assert!(m.update_progress(0.4, 210).is_err());
        m.update_progress(0.5, 220).unwrap();
        m.update_progress(0.9, 230).unwrap();
    }

    #[test]
    fn test_progress_requires_live_state() {
        let mut m = mission(MissionState::Pending);
        assert!(m.update_progress(0.1, 200).is_err());

        let mut m = mission(MissionState::Paused);
        // Paused missions still accept (monotone) progress reports.
        m.update_progress(0.2, 200).unwrap();
    }

    #[test]
    fn test_progress_range() {
        let mut m = mission(MissionState::Running);
        assert!(m.update_progress(1.5, 200).is_err());
        assert!(m.update_progress(-0.1, 200).is_err());
    }
}
