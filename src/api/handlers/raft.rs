//! Inter-node verbs: RequestVote, AppendEntries, InstallSnapshot, and
//! DataSyncPush. Peers call these; operators never do.

use crate::api::AppState;
use crate::consensus::rpc::{DataSyncPushRequest, DataSyncPushResponse};
use crate::consensus::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use axum::extract::State;
use axum::Json;

pub async fn request_vote(
    State(state): State<AppState>,
    Json(req): Json<VoteRequest>,
) -> Json<crate::consensus::VoteResponse> {
    Json(state.raft.handle_vote_request(&req))
}

pub async fn append_entries(
    State(state): State<AppState>,
    Json(req): Json<AppendEntriesRequest>,
) -> Json<crate::consensus::AppendEntriesResponse> {
    Json(state.raft.handle_append_entries(&req))
}

pub async fn install_snapshot(
    State(state): State<AppState>,
    Json(req): Json<InstallSnapshotRequest>,
) -> Json<crate::consensus::InstallSnapshotResponse> {
    Json(state.raft.handle_install_snapshot(&req))
}

/// Direct operation push from a peer node or peer region; each operation
/// runs through the usual version-based conflict resolution.
pub async fn data_sync_push(
    State(state): State<AppState>,
    Json(req): Json<DataSyncPushRequest>,
) -> Json<DataSyncPushResponse> {
    let mut accepted = 0;
    let mut rejected = 0;
    for op in &req.operations {
        match state.sync.apply(op) {
            Ok(()) => accepted += 1,
            Err(_) => rejected += 1,
        }
    }
    Json(DataSyncPushResponse { accepted, rejected })
}
