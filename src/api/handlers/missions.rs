//! Mission lifecycle endpoints.

use crate::api::envelope::{respond, ApiResponse};
use crate::api::AppState;
use crate::scheduler::CreateMissionRequest;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;

pub async fn list(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.scheduler.list())
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.scheduler.get(&id))
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateMissionRequest>,
) -> Response {
    match state.scheduler.create(req) {
        Ok(mission) => ApiResponse::created(mission),
        Err(e) => crate::api::envelope::error_response(&e),
    }
}

pub async fn dispatch(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.scheduler.dispatch(&id))
}

pub async fn pause(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.scheduler.pause(&id))
}

pub async fn resume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.scheduler.resume(&id))
}

pub async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.scheduler.cancel(&id))
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub progress: f64,
}

pub async fn progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ProgressRequest>,
) -> Response {
    respond(state.scheduler.update_progress(&id, req.progress))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

pub async fn complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Response {
    respond(state.scheduler.complete(&id, req.success, req.error.as_deref()))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.scheduler.delete(&id).map(|()| serde_json::json!({"deleted": id})))
}
