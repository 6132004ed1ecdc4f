//! Health, events, alerts, targets, load balancing, and statistics.

use crate::api::envelope::{error_response, respond, ApiResponse};
use crate::api::AppState;
use crate::alerting::AlertRule;
use crate::broadcast::StreamMessage;
use crate::coordinator::TargetInfo;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;

pub async fn health(State(state): State<AppState>) -> Response {
    let raft = state.raft.status();
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "node_id": raft.node_id,
        "role": raft.role,
        "term": raft.term,
        "leader_hint": raft.leader_hint,
        "uav_count": state.fleet.list().len(),
        "viewer_count": state.broadcaster.connection_count(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn events(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Response {
    ApiResponse::ok(state.scheduler.recent_events(q.limit))
}

pub async fn alerts(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Response {
    ApiResponse::ok(serde_json::json!({
        "active": state.alerts.active_alerts(),
        "history": state.alerts.alert_history(q.limit),
        "rules": state.alerts.rules(),
    }))
}

pub async fn add_alert_rule(
    State(state): State<AppState>,
    Json(rule): Json<AlertRule>,
) -> Response {
    state.alerts.add_rule(rule.clone());
    ApiResponse::created(rule)
}

pub async fn remove_alert_rule(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    state.alerts.remove_rule(&id);
    ApiResponse::ok(serde_json::json!({"deleted": id}))
}

pub async fn load_balance_suggestions(State(state): State<AppState>) -> Response {
    let uavs = state.fleet.list();
    ApiResponse::ok(state.coordinator.load_balance_suggestions(&uavs))
}

pub async fn list_targets(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.coordinator.list_targets())
}

pub async fn register_target(
    State(state): State<AppState>,
    Json(target): Json<TargetInfo>,
) -> Response {
    match state.coordinator.register_target(target) {
        Ok(target) => {
            state
                .broadcaster
                .publish(StreamMessage::Detection { data: target.clone() });
            ApiResponse::created(target)
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplanRequest {
    pub path: crate::coordinator::FlightPath,
    #[serde(default)]
    pub other_paths: Vec<crate::coordinator::FlightPath>,
}

/// Cooperative path replanning: returns a detoured path when the
/// submitted path conflicts with a peer's, and streams it to viewers.
pub async fn replan_path(
    State(state): State<AppState>,
    Json(req): Json<ReplanRequest>,
) -> Response {
    match state
        .coordinator
        .replan_conflicting_path(&req.path, &req.other_paths)
    {
        Some((replanned, conflicts)) => {
            state.broadcaster.publish(StreamMessage::SearchPath {
                uav_id: replanned.uav_id.clone(),
                path: replanned.waypoints.iter().map(|w| w.position).collect(),
            });
            ApiResponse::ok(serde_json::json!({
                "replanned": replanned,
                "conflicts": conflicts,
            }))
        }
        None => ApiResponse::ok(serde_json::json!({
            "replanned": serde_json::Value::Null,
            "conflicts": [],
        })),
    }
}

/// Record a metric sample (node agents push CPU/memory here; the
/// autoscaler and alert rules read them back).
pub async fn record_metric(
    State(state): State<AppState>,
    Json(metric): Json<crate::alerting::Metric>,
) -> Response {
    state.metrics.record(metric.clone());
    ApiResponse::created(metric)
}

pub async fn region_stats(State(state): State<AppState>) -> Response {
    ApiResponse::ok(serde_json::json!({
        "regions": state.regions.list_regions(),
        "stats": state.regions.stats(),
    }))
}

/// Operational statistics across the subsystems.
pub async fn stats(State(state): State<AppState>) -> Response {
    let rpc_stats = state
        .rpc
        .as_ref()
        .map(|t| t.stats_snapshot())
        .unwrap_or_default();
    respond(Ok(serde_json::json!({
        "raft": state.raft.status(),
        "sync": state.sync.stats(),
        "telemetry": state.telemetry.stats(),
        "broadcast": {
            "connections": state.broadcaster.connection_count(),
            "dropped": state.broadcaster.dropped_count(),
            "delivered": state.broadcaster.delivered_count(),
        },
        "rpc_peers": rpc_stats,
        "autoscale_history": state.autoscaler.history(20),
        "metric_names": state.metrics.names(),
    })))
}
