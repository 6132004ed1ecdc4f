//! UAV registry endpoints.

use crate::api::envelope::{respond, ApiResponse};
use crate::api::AppState;
use crate::broadcast::StreamMessage;
use crate::types::UavCapabilities;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;

pub async fn list(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.fleet.list())
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.fleet.get(&id) {
        Some(uav) => ApiResponse::ok(uav),
        None => crate::api::envelope::ApiErrorResponse::not_found(format!("uav {id}")),
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub uav_id: String,
    #[serde(default)]
    pub capabilities: UavCapabilities,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    match state
        .fleet
        .register(&req.uav_id, req.capabilities, req.metadata)
    {
        Ok(uav) => {
            state.broadcaster.publish(StreamMessage::UavRegistered {
                uav_id: uav.uav_id.clone(),
                timestamp: uav.last_heartbeat,
            });
            ApiResponse::created(uav)
        }
        Err(e) => crate::api::envelope::error_response(&e),
    }
}

pub async fn heartbeat(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(
        state
            .fleet
            .heartbeat(&id)
            .map(|()| serde_json::json!({"uav_id": id, "status": "ok"})),
    )
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(
        state
            .fleet
            .remove(&id)
            .map(|()| serde_json::json!({"deleted": id})),
    )
}

/// Latest accepted telemetry for one vehicle.
pub async fn telemetry(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.telemetry.state_of(&id) {
        Some(msg) => ApiResponse::ok(msg),
        None => crate::api::envelope::ApiErrorResponse::not_found(format!(
            "no telemetry for uav {id}"
        )),
    }
}
