//! Viewer broadcast pipeline.
//!
//! Outbound messages flow through one bounded queue drained by a single
//! fan-out task. When the queue is full the newest message is dropped and
//! a counter incremented — ingress throughput is never sacrificed to a
//! slow viewer. Subscribers beyond the connection cap are refused with an
//! explicit close code; connections whose channel goes away are reaped by
//! the fan-out task. A periodic ping flushes out silently dead peers.

use crate::coordinator::{ClusterProgress, TargetInfo};
use crate::error::{CoreError, CoreResult};
use crate::types::{Area, GeoPoint, MissionEvent, TelemetryMessage};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// WebSocket close code sent when the subscriber cap is reached
/// (1008 = policy violation).
pub const CLOSE_CODE_CAPACITY: u16 = 1008;

/// Per-connection outbound buffer.
const CONNECTION_BUFFER: usize = 64;

/// Everything a viewer can receive, discriminated by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Telemetry { data: TelemetryMessage },
    UavRegistered { uav_id: String, timestamp: u64 },
    MissionEvent { data: MissionEvent },
    ClusterMissionCreated { data: serde_json::Value },
    SearchArea { cluster_mission_id: String, areas: Vec<Area> },
    Detection { data: TargetInfo },
    SearchProgress { data: ClusterProgress },
    SearchPath { uav_id: String, path: Vec<GeoPoint> },
    Ping,
}

pub struct ViewerBroadcaster {
    connections: DashMap<u64, mpsc::Sender<StreamMessage>>,
    next_connection_id: AtomicU64,
    queue_tx: mpsc::Sender<StreamMessage>,
    queue_rx: Mutex<Option<mpsc::Receiver<StreamMessage>>>,
    max_connections: usize,
    heartbeat_interval: Duration,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl ViewerBroadcaster {
    pub fn new(max_connections: usize, max_queue_size: usize, heartbeat_interval: Duration) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(max_queue_size.max(1));
        Self {
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            max_connections,
            heartbeat_interval,
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn from_config() -> Self {
        let cfg = &crate::config::get().broadcast;
        Self::new(
            cfg.max_connections,
            cfg.max_queue_size,
            Duration::from_secs(cfg.heartbeat_interval_secs),
        )
    }

    /// Enqueue without blocking. A full queue drops this (newest) message.
    pub fn publish(&self, message: StreamMessage) {
        match self.queue_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    warn!(dropped, "Broadcast queue full, dropping messages");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Broadcast queue closed");
            }
        }
    }

    /// Register a viewer. Refused with CAPACITY_EXHAUSTED past the cap —
    /// the transport layer translates that into close code 1008.
    pub fn subscribe(&self) -> CoreResult<(u64, mpsc::Receiver<StreamMessage>)> {
        if self.connections.len() >= self.max_connections {
            return Err(CoreError::CapacityExhausted(format!(
                "viewer cap {} reached",
                self.max_connections
            )));
        }
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        self.connections.insert(id, tx);
        info!(connection_id = id, viewers = self.connections.len(), "Viewer connected");
        Ok((id, rx))
    }

    pub fn unsubscribe(&self, connection_id: u64) {
        if self.connections.remove(&connection_id).is_some() {
            info!(
                connection_id,
                viewers = self.connections.len(),
                "Viewer disconnected"
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// The single fan-out worker: drain the queue, write to every
    /// subscriber, reap the ones whose channel is gone.
    pub async fn run_fanout(self: Arc<Self>, cancel: CancellationToken) {
        let mut queue_rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("Fan-out worker already running");
                return;
            }
        };
        info!("Broadcast fan-out worker started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Broadcast fan-out worker stopped");
                    return;
                }
                message = queue_rx.recv() => {
                    let Some(message) = message else { return };
                    self.fan_out(&message);
                }
            }
        }
    }

    fn fan_out(&self, message: &StreamMessage) {
        let mut dead = Vec::new();
        for entry in self.connections.iter() {
            match entry.value().try_send(message.clone()) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow viewer: this message is lost for them, the
                    // connection survives.
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.unsubscribe(id);
        }
    }

    /// Periodic ping to every connection; dead peers surface as closed
    /// channels and are reaped by the fan-out path.
    pub async fn run_heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.heartbeat_interval.as_secs(),
            "Viewer heartbeat started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Viewer heartbeat stopped");
                    return;
                }
                () = tokio::time::sleep(self.heartbeat_interval) => {
                    self.fan_out(&StreamMessage::Ping);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broadcaster(max_connections: usize, max_queue: usize) -> Arc<ViewerBroadcaster> {
        Arc::new(ViewerBroadcaster::new(
            max_connections,
            max_queue,
            Duration::from_secs(30),
        ))
    }

    #[tokio::test]
    async fn test_subscriber_cap_refused() {
        let b = broadcaster(2, 10);
        let _a = b.subscribe().unwrap();
        let _b = b.subscribe().unwrap();
        assert!(matches!(
            b.subscribe(),
            Err(CoreError::CapacityExhausted(_))
        ));
        assert_eq!(b.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_frees_slot() {
        let b = broadcaster(1, 10);
        let (id, _rx) = b.subscribe().unwrap();
        b.unsubscribe(id);
        assert!(b.subscribe().is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest_and_counts() {
        let b = broadcaster(10, 2);
        // No fan-out worker running: the queue fills up.
        b.publish(StreamMessage::Ping);
        b.publish(StreamMessage::Ping);
        b.publish(StreamMessage::Ping); // dropped
        b.publish(StreamMessage::Ping); // dropped
        assert_eq!(b.dropped_count(), 2);
    }

    #[tokio::test]
    async fn test_fanout_delivers_to_all_subscribers() {
        let b = broadcaster(10, 16);
        let (_id1, mut rx1) = b.subscribe().unwrap();
        let (_id2, mut rx2) = b.subscribe().unwrap();

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(b.clone().run_fanout(cancel.clone()));

        b.publish(StreamMessage::UavRegistered {
            uav_id: "u1".into(),
            timestamp: 100,
        });

        for rx in [&mut rx1, &mut rx2] {
            let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match msg {
                StreamMessage::UavRegistered { uav_id, .. } => assert_eq!(uav_id, "u1"),
                other => panic!("unexpected message: {other:?}"),
            }
        }

        cancel.cancel();
        let _ = worker.await;
    }

    #[tokio::test]
    async fn test_dead_subscriber_reaped_without_disturbing_others() {
        let b = broadcaster(10, 16);
        let (_id1, rx1) = b.subscribe().unwrap();
        let (_id2, mut rx2) = b.subscribe().unwrap();
        drop(rx1); // dead peer

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(b.clone().run_fanout(cancel.clone()));

        b.publish(StreamMessage::Ping);
        let msg = tokio::time::timeout(Duration::from_secs(1), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, StreamMessage::Ping));

        // Give the worker a beat to finish reaping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.connection_count(), 1);

        cancel.cancel();
        let _ = worker.await;
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = StreamMessage::UavRegistered {
            uav_id: "u1".into(),
            timestamp: 5,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "uav_registered");
        assert_eq!(value["uav_id"], "u1");

        let ping = serde_json::to_value(StreamMessage::Ping).unwrap();
        assert_eq!(ping["type"], "ping");
    }
}
