//! Viewer WebSocket stream.
//!
//! One bi-directional socket per viewer. Outbound traffic comes from the
//! broadcast pipeline; inbound messages from viewers are ignored. A
//! connection beyond the subscriber cap is closed immediately with the
//! policy-violation close code.

use crate::api::AppState;
use crate::broadcast::CLOSE_CODE_CAPACITY;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tracing::{debug, info};

pub async fn viewer_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_viewer(socket, state))
}

async fn handle_viewer(mut socket: WebSocket, state: AppState) {
    let (connection_id, mut rx) = match state.broadcaster.subscribe() {
        Ok(pair) => pair,
        Err(e) => {
            info!(error = %e, "Viewer refused: connection cap reached");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_CODE_CAPACITY,
                    reason: "viewer connection cap reached".into(),
                })))
                .await;
            return;
        }
    };

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    // Viewers only listen; anything they send is ignored.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(other)) => {
                        debug!(connection_id, kind = ?message_kind(&other), "Ignoring inbound viewer message");
                    }
                }
            }
        }
    }

    state.broadcaster.unsubscribe(connection_id);
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
    }
}
