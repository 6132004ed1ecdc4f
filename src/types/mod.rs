//! Shared data structures for the fleet control plane.
//!
//! - Geographic primitives and Haversine math
//! - UAV registry records (status, capabilities, heartbeat)
//! - Mission lifecycle state machine and cluster missions
//! - Telemetry wire format with ingress validation
//! - Coordination events

mod events;
mod geo;
mod mission;
mod sync;
mod telemetry;
mod uav;

pub use events::*;
pub use geo::*;
pub use mission::*;
pub use sync::*;
pub use telemetry::*;
pub use uav::*;
