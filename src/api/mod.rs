//! HTTP/WebSocket surface: operator API, telemetry ingress, viewer
//! stream, and inter-node raft/sync verbs.

pub mod envelope;
pub mod handlers;
mod ws;

use crate::alerting::{AlertManager, MetricsStore};
use crate::autoscale::AutoScaler;
use crate::broadcast::ViewerBroadcaster;
use crate::consensus::{HttpTransport, RaftNode};
use crate::coordinator::Coordinator;
use crate::fleet::{ClusterRegistry, FleetInventory};
use crate::regions::CrossRegionSync;
use crate::scheduler::MissionScheduler;
use crate::sync::DataSynchronizer;
use crate::telemetry::TelemetryService;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Every component handle the handlers need, injected once at startup.
#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<FleetInventory>,
    pub clusters: Arc<ClusterRegistry>,
    pub scheduler: Arc<MissionScheduler>,
    pub coordinator: Arc<Coordinator>,
    pub telemetry: Arc<TelemetryService>,
    pub broadcaster: Arc<ViewerBroadcaster>,
    pub raft: Arc<RaftNode>,
    pub sync: Arc<DataSynchronizer>,
    pub regions: Arc<CrossRegionSync>,
    pub autoscaler: Arc<AutoScaler>,
    pub metrics: Arc<MetricsStore>,
    pub alerts: Arc<AlertManager>,
    /// Present when the node talks HTTP to its peers (absent in tests).
    pub rpc: Option<Arc<HttpTransport>>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/api/v1/health", get(handlers::system::health))
        // Missions
        .route(
            "/api/v1/missions",
            get(handlers::missions::list).post(handlers::missions::create),
        )
        .route(
            "/api/v1/missions/:id",
            get(handlers::missions::get).delete(handlers::missions::remove),
        )
        .route("/api/v1/missions/:id/dispatch", post(handlers::missions::dispatch))
        .route("/api/v1/missions/:id/pause", post(handlers::missions::pause))
        .route("/api/v1/missions/:id/resume", post(handlers::missions::resume))
        .route("/api/v1/missions/:id/cancel", post(handlers::missions::cancel))
        .route("/api/v1/missions/:id/progress", post(handlers::missions::progress))
        .route("/api/v1/missions/:id/complete", post(handlers::missions::complete))
        // UAVs
        .route(
            "/api/v1/uavs",
            get(handlers::uavs::list).post(handlers::uavs::register),
        )
        .route("/api/v1/uavs/:id", get(handlers::uavs::get).delete(handlers::uavs::remove))
        .route("/api/v1/uavs/:id/heartbeat", post(handlers::uavs::heartbeat))
        .route("/api/v1/uavs/:id/telemetry", get(handlers::uavs::telemetry))
        // Clusters
        .route(
            "/api/v1/clusters",
            get(handlers::clusters::list).post(handlers::clusters::create),
        )
        .route("/api/v1/clusters/:id/members", post(handlers::clusters::add_member))
        // Cluster missions
        .route(
            "/api/v1/cluster-missions",
            post(handlers::clusters::create_cluster_mission),
        )
        .route(
            "/api/v1/cluster-missions/:id",
            get(handlers::clusters::get_cluster_mission)
                .delete(handlers::clusters::delete_cluster_mission),
        )
        .route(
            "/api/v1/cluster-missions/:id/progress",
            get(handlers::clusters::cluster_progress),
        )
        // Coordination extras
        .route(
            "/api/v1/load-balance/suggestions",
            get(handlers::system::load_balance_suggestions),
        )
        .route(
            "/api/v1/targets",
            get(handlers::system::list_targets).post(handlers::system::register_target),
        )
        .route("/api/v1/paths/replan", post(handlers::system::replan_path))
        // Events, alerts, stats
        .route("/api/v1/events", get(handlers::system::events))
        .route("/api/v1/alerts", get(handlers::system::alerts))
        .route("/api/v1/alerts/rules", post(handlers::system::add_alert_rule))
        .route("/api/v1/alerts/rules/:id", delete(handlers::system::remove_alert_rule))
        .route("/api/v1/stats", get(handlers::system::stats))
        .route("/api/v1/metrics", post(handlers::system::record_metric))
        .route("/api/v1/regions", get(handlers::system::region_stats))
        // Telemetry ingress
        .route("/api/v1/telemetry", post(handlers::telemetry::ingest))
        // Viewer stream
        .route("/ws", get(ws::viewer_stream))
        // Inter-node verbs
        .route("/raft/request_vote", post(handlers::raft::request_vote))
        .route("/raft/append_entries", post(handlers::raft::append_entries))
        .route("/raft/install_snapshot", post(handlers::raft::install_snapshot))
        .route("/sync/push", post(handlers::raft::data_sync_push))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
