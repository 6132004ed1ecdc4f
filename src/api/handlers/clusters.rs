//! Cluster registry and cluster mission endpoints.

use crate::api::envelope::{error_response, respond, ApiResponse};
use crate::api::AppState;
use crate::broadcast::StreamMessage;
use crate::fleet::ClusterRole;
use crate::scheduler::CreateClusterMissionRequest;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;

pub async fn list(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.clusters.list())
}

#[derive(Debug, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub members: Vec<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateClusterRequest>,
) -> Response {
    match state
        .clusters
        .create(&req.name, &req.description, &req.members)
    {
        Ok(cluster) => ApiResponse::created(cluster),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub uav_id: String,
    #[serde(default = "default_role")]
    pub role: ClusterRole,
}

fn default_role() -> ClusterRole {
    ClusterRole::Worker
}

pub async fn add_member(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AddMemberRequest>,
) -> Response {
    respond(state.clusters.add_member(&id, &req.uav_id, req.role))
}

/// Create a cluster mission: select vehicles, split the polygon, dispatch
/// sub-missions, and hand the result to the coordinator.
pub async fn create_cluster_mission(
    State(state): State<AppState>,
    Json(req): Json<CreateClusterMissionRequest>,
) -> Response {
    match state.scheduler.create_cluster_mission(req) {
        Ok(cluster) => {
            state.coordinator.register_cluster_mission(&cluster);
            state
                .broadcaster
                .publish(StreamMessage::ClusterMissionCreated {
                    data: serde_json::to_value(&cluster).unwrap_or_default(),
                });
            state.broadcaster.publish(StreamMessage::SearchArea {
                cluster_mission_id: cluster.cluster_mission_id.clone(),
                areas: cluster.sub_missions.iter().map(|s| s.area.clone()).collect(),
            });
            ApiResponse::created(cluster)
        }
        Err(e) => error_response(&e),
    }
}

pub async fn get_cluster_mission(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    respond(state.scheduler.get_cluster_mission(&id))
}

pub async fn delete_cluster_mission(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    respond(
        state
            .scheduler
            .delete_cluster_mission(&id)
            .map(|()| serde_json::json!({"deleted": id})),
    )
}

pub async fn cluster_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let progress = state.coordinator.cluster_progress(&id);
    state.broadcaster.publish(StreamMessage::SearchProgress {
        data: state.coordinator.cluster_progress(&id),
    });
    ApiResponse::ok(progress)
}
