//! Telemetry ingress endpoint.

use crate::api::envelope::{error_response, ApiResponse};
use crate::api::AppState;
use crate::broadcast::StreamMessage;
use crate::types::{GeoPoint, TelemetryMessage};
use axum::extract::State;
use axum::response::Response;
use axum::Json;

/// POST /api/v1/telemetry
///
/// Validation failures surface as 400 with the VALIDATION kind; anything
/// else is an internal failure. Significant updates flow to viewers and,
/// when the vehicle flies a tracked mission, into the coordinator.
pub async fn ingest(
    State(state): State<AppState>,
    Json(msg): Json<TelemetryMessage>,
) -> Response {
    let uav_id = msg.uav_id.clone();
    match state.telemetry.ingest(msg) {
        Ok(Some(significant)) => {
            let position = GeoPoint::new(
                significant.position.lat,
                significant.position.lon,
                significant.position.alt,
            );
            // Vehicles without a tracked mission are fine; skip silently.
            let _ = state.coordinator.update_state(
                &uav_id,
                position,
                None,
                Some(significant.battery.percent),
            );
            state
                .broadcaster
                .publish(StreamMessage::Telemetry { data: significant });
            ApiResponse::ok(serde_json::json!({"uav_id": uav_id, "broadcast": true}))
        }
        Ok(None) => ApiResponse::ok(serde_json::json!({"uav_id": uav_id, "broadcast": false})),
        Err(e) => error_response(&e),
    }
}
