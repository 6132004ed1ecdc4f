//! Skymesh: distributed control plane for cooperative UAV fleets.
//!
//! ## Architecture
//!
//! - **Fleet Inventory**: UAV registry with heartbeat tracking and a
//!   liveness scan feeding failure reassignment
//! - **Mission Scheduler**: lifecycle state machine, priority dispatch,
//!   adaptive retry
//! - **Planner**: polygon decomposition and pluggable UAV assignment
//!   strategies (greedy, proximity, genetic, PSO, multi-objective)
//! - **Coordinator**: per-vehicle mission state, separation conflicts,
//!   path replanning, load balancing
//! - **Consensus**: Raft-style replicated log with snapshotting; the data
//!   sync layer rides on it with versioned last-writer-wins resolution
//! - **Telemetry pipeline**: validated ingress, change detection, bounded
//!   viewer fan-out
//! - **Operations**: cross-region replication, autoscaling, alerting

pub mod alerting;
pub mod api;
pub mod autoscale;
pub mod broadcast;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod fleet;
pub mod ids;
pub mod planner;
pub mod regions;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod types;

// Re-export the error type used across every component boundary
pub use error::{CoreError, CoreResult, ErrorKind};

// Re-export the core data model
pub use types::{
    Area, ClusterMission, GeoPoint, Mission, MissionKind, MissionState, SyncOperation,
    TelemetryMessage, Uav, UavCapabilities, UavStatus,
};

// Re-export the main component handles
pub use broadcast::ViewerBroadcaster;
pub use consensus::{RaftNode, RaftRole};
pub use coordinator::Coordinator;
pub use fleet::FleetInventory;
pub use scheduler::MissionScheduler;
pub use storage::{Repository, SledRepository};
pub use sync::DataSynchronizer;
pub use telemetry::TelemetryService;
