//! HTTP surface regression: envelope shapes, status codes, and the
//! telemetry ingress validation split (400 for bad data, 2xx otherwise).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use skymesh::alerting::{AlertManager, MetricsStore};
use skymesh::api::{create_router, AppState};
use skymesh::autoscale::{AutoScaler, ScalingPolicy};
use skymesh::broadcast::ViewerBroadcaster;
use skymesh::consensus::{LoopbackTransport, NullStateMachine, RaftNode, RaftOptions};
use skymesh::coordinator::Coordinator;
use skymesh::fleet::{ClusterRegistry, FleetInventory};
use skymesh::regions::CrossRegionSync;
use skymesh::scheduler::MissionScheduler;
use skymesh::storage::{Repository, SledRepository};
use skymesh::sync::DataSynchronizer;
use skymesh::telemetry::TelemetryService;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_state() -> AppState {
    let repo: Arc<dyn Repository> = Arc::new(SledRepository::open_temporary().unwrap());
    let fleet = Arc::new(FleetInventory::open(repo.clone()).unwrap());
    let clusters = Arc::new(ClusterRegistry::open(repo.clone()).unwrap());
    let scheduler = Arc::new(MissionScheduler::open(repo.clone(), fleet.clone()).unwrap());
    let coordinator = Arc::new(Coordinator::new(50.0, 50.0));
    let telemetry = Arc::new(TelemetryService::new(fleet.clone()));
    let broadcaster = Arc::new(ViewerBroadcaster::new(100, 1000, Duration::from_secs(30)));
    let metrics = Arc::new(MetricsStore::new(Duration::from_secs(3600)));
    let alerts = Arc::new(AlertManager::new(metrics.clone()));
    let regions = Arc::new(CrossRegionSync::new("region-1"));
    let sync = DataSynchronizer::new("test-node", repo.clone(), scheduler.clone(), fleet.clone());
    let raft = RaftNode::new(
        "test-node",
        vec![],
        repo,
        Arc::new(LoopbackTransport::new()),
        Arc::new(NullStateMachine),
        RaftOptions {
            election_timeout_min: Duration::from_secs(60),
            election_timeout_max: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(1),
            snapshot_threshold: 1000,
        },
    )
    .unwrap();
    sync.attach_raft(raft.clone());
    let autoscaler = Arc::new(AutoScaler::new(
        ScalingPolicy {
            min_nodes: 1,
            max_nodes: 10,
            scale_up_threshold: 80.0,
            scale_down_threshold: 50.0,
            scale_up_cooldown: Duration::from_secs(300),
            scale_down_cooldown: Duration::from_secs(600),
        },
        Arc::new(|_| true),
        Arc::new(|_: &[String]| true),
    ));

    AppState {
        fleet,
        clusters,
        scheduler,
        coordinator,
        telemetry,
        broadcaster,
        raft,
        sync,
        regions,
        autoscaler,
        metrics,
        alerts,
        rpc: None,
    }
}

async fn request(
    router: &axum::Router,
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_node_identity() {
    let router = create_router(test_state());
    let (status, body) = request(&router, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["node_id"], "test-node");
}

#[tokio::test]
async fn register_and_dispatch_over_http() {
    let router = create_router(test_state());

    let (status, body) = request(
        &router,
        "POST",
        "/api/v1/uavs",
        Some(serde_json::json!({
            "uav_id": "u1",
            "capabilities": { "max_altitude_m": 120.0 },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["uav_id"], "u1");
    assert_eq!(body["data"]["status"], "ONLINE");

    let (status, body) = request(
        &router,
        "POST",
        "/api/v1/missions",
        Some(serde_json::json!({
            "name": "survey",
            "kind": "SINGLE_UAV",
            "uav_list": ["u1"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let mission_id = body["data"]["mission_id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["state"], "PENDING");

    let (status, body) = request(
        &router,
        "POST",
        &format!("/api/v1/missions/{mission_id}/dispatch"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "RUNNING");

    let (status, body) = request(&router, "GET", "/api/v1/uavs/u1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "BUSY");
}

#[tokio::test]
async fn invalid_lifecycle_edge_is_conflict() {
    let router = create_router(test_state());
    let (_, body) = request(
        &router,
        "POST",
        "/api/v1/missions",
        Some(serde_json::json!({ "name": "m", "kind": "SINGLE_UAV" })),
    )
    .await;
    let mission_id = body["data"]["mission_id"].as_str().unwrap().to_string();

    // Pausing a PENDING mission is not a lifecycle edge.
    let (status, body) = request(
        &router,
        "POST",
        &format!("/api/v1/missions/{mission_id}/pause"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INVALID_STATE");
}

#[tokio::test]
async fn missing_mission_is_not_found() {
    let router = create_router(test_state());
    let (status, body) = request(&router, "GET", "/api/v1/missions/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

fn telemetry_body(lat: f64, timestamp_ms: u64) -> serde_json::Value {
    serde_json::json!({
        "uav_id": "u1",
        "timestamp_ms": timestamp_ms,
        "position": { "lat": lat, "lon": 127.0, "alt": 50.0 },
        "attitude": { "roll": 0.0, "pitch": 0.0, "yaw": 0.0 },
        "velocity": { "vx": 1.0, "vy": 0.0, "vz": 0.0 },
        "battery": { "percent": 75.0, "voltage_mv": 11400 },
        "gps": { "fix_type": 3, "num_sat": 11 },
        "link_quality": 88,
        "flight_mode": "AUTO",
    })
}

#[tokio::test]
async fn telemetry_validation_split() {
    let router = create_router(test_state());
    let now = skymesh::ids::unix_millis();

    // Valid message: accepted and broadcast.
    let (status, body) =
        request(&router, "POST", "/api/v1/telemetry", Some(telemetry_body(37.5, now))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["broadcast"], true);

    // Bad latitude: 400 with the VALIDATION kind.
    let (status, body) =
        request(&router, "POST", "/api/v1/telemetry", Some(telemetry_body(95.0, now))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION");

    // Future timestamp: rejected.
    let (status, _) = request(
        &router,
        "POST",
        "/api/v1/telemetry",
        Some(telemetry_body(37.5, now + 10_000)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn raft_verbs_respond() {
    let router = create_router(test_state());
    let (status, body) = request(
        &router,
        "POST",
        "/raft/request_vote",
        Some(serde_json::json!({
            "term": 1,
            "candidate_id": "peer",
            "last_log_index": 0,
            "last_log_term": 0,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["vote_granted"], true);

    let (status, body) = request(
        &router,
        "POST",
        "/sync/push",
        Some(serde_json::json!({ "origin": "peer", "operations": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], 0);
}

#[tokio::test]
async fn alert_rules_roundtrip() {
    let state = test_state();
    let metrics = state.metrics.clone();
    let alerts = state.alerts.clone();
    let router = create_router(state);

    let (status, _) = request(
        &router,
        "POST",
        "/api/v1/alerts/rules",
        Some(serde_json::json!({
            "rule_id": "battery-low",
            "name": "Battery low",
            "metric_name": "battery_percent",
            "comparison": "<",
            "threshold": 20.0,
            "severity": "WARNING",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    metrics.record(skymesh::alerting::Metric::gauge("battery_percent", 10.0));
    alerts.evaluate_tick();

    let (status, body) = request(&router, "GET", "/api/v1/alerts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["active"].as_array().unwrap().len(), 1);
}
