//! Request handlers, grouped by resource.

pub mod clusters;
pub mod missions;
pub mod raft;
pub mod system;
pub mod telemetry;
pub mod uavs;
