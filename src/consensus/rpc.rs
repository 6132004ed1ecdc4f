//! Inter-node RPC transport.
//!
//! The consensus layer and data sync speak to peers exclusively through
//! [`RaftTransport`]. The production implementation is HTTP over reqwest
//! with per-call deadlines, bounded exponential backoff with jitter, a
//! bounded per-peer client cache, and per-peer outcome counters. Peer
//! addresses come from the discovery layer, never from code.
//!
//! [`LoopbackTransport`] wires nodes together in-process; the consensus
//! integration tests run whole clusters on it.

use super::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftNode, VoteRequest, VoteResponse,
};
use crate::discovery::DiscoveryBackend;
use crate::error::{CoreError, CoreResult};
use crate::types::SyncOperation;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSyncPushRequest {
    pub origin: String,
    pub operations: Vec<SyncOperation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSyncPushResponse {
    pub accepted: usize,
    pub rejected: usize,
}

/// Per-peer call accounting.
#[derive(Debug, Default)]
pub struct PeerStats {
    pub total: AtomicU64,
    pub success: AtomicU64,
    pub failure: AtomicU64,
    pub timeout: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatsSnapshot {
    pub peer: String,
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub timeout: u64,
}

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, peer: &str, req: &VoteRequest) -> CoreResult<VoteResponse>;
    async fn append_entries(
        &self,
        peer: &str,
        req: &AppendEntriesRequest,
    ) -> CoreResult<AppendEntriesResponse>;
    async fn install_snapshot(
        &self,
        peer: &str,
        req: &InstallSnapshotRequest,
    ) -> CoreResult<InstallSnapshotResponse>;
    async fn data_sync_push(
        &self,
        peer: &str,
        req: &DataSyncPushRequest,
    ) -> CoreResult<DataSyncPushResponse>;
    /// Generic peer health probe.
    async fn probe(&self, peer: &str) -> CoreResult<()>;
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

pub struct HttpTransport {
    discovery: Arc<dyn DiscoveryBackend>,
    /// Bounded per-peer client cache; a client per peer keeps connections
    /// alive between calls.
    clients: DashMap<String, reqwest::Client>,
    stats: DashMap<String, Arc<PeerStats>>,
    timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_multiplier: f64,
    pool_size: usize,
}

impl HttpTransport {
    pub fn new(discovery: Arc<dyn DiscoveryBackend>) -> Self {
        let cfg = &crate::config::get().rpc;
        Self {
            discovery,
            clients: DashMap::new(),
            stats: DashMap::new(),
            timeout: cfg.timeout(),
            max_attempts: cfg.max_attempts,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_multiplier: cfg.backoff_multiplier,
            pool_size: cfg.pool_size,
        }
    }

    fn client_for(&self, peer: &str) -> reqwest::Client {
        if let Some(client) = self.clients.get(peer) {
            return client.clone();
        }
        // Evict arbitrarily when the cache is full; the evicted peer gets
        // a fresh client on its next call.
        if self.clients.len() >= self.pool_size {
            if let Some(victim) = self.clients.iter().next().map(|e| e.key().clone()) {
                self.clients.remove(&victim);
            }
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_default();
        self.clients.insert(peer.to_string(), client.clone());
        client
    }

    fn stats_for(&self, peer: &str) -> Arc<PeerStats> {
        self.stats
            .entry(peer.to_string())
            .or_insert_with(|| Arc::new(PeerStats::default()))
            .clone()
    }

    pub fn stats_snapshot(&self) -> Vec<PeerStatsSnapshot> {
        let mut out: Vec<PeerStatsSnapshot> = self
            .stats
            .iter()
            .map(|entry| PeerStatsSnapshot {
                peer: entry.key().clone(),
                total: entry.total.load(Ordering::Relaxed),
                success: entry.success.load(Ordering::Relaxed),
                failure: entry.failure.load(Ordering::Relaxed),
                timeout: entry.timeout.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by(|a, b| a.peer.cmp(&b.peer));
        out
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let jitter = base * 0.1 * rand::thread_rng().gen::<f64>();
        Duration::from_secs_f64(base + jitter)
    }

    /// POST with retry. Timeouts and connection errors retry with backoff;
    /// HTTP 4xx responses are classified non-retryable.
    async fn post_with_retry<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        peer: &str,
        path: &str,
        req: &Req,
    ) -> CoreResult<Resp> {
        let address = self.discovery.resolve(peer).await?;
        let url = format!("{}/{}", address.trim_end_matches('/'), path);
        let client = self.client_for(peer);
        let stats = self.stats_for(peer);

        let mut last_error = CoreError::Transient("rpc never attempted".into());
        for attempt in 0..self.max_attempts {
            stats.total.fetch_add(1, Ordering::Relaxed);
            match client.post(&url).json(req).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp
                        .json::<Resp>()
                        .await
                        .map_err(|e| CoreError::Transient(format!("rpc decode: {e}")))?;
                    stats.success.fetch_add(1, Ordering::Relaxed);
                    return Ok(body);
                }
                Ok(resp) => {
                    stats.failure.fetch_add(1, Ordering::Relaxed);
                    let status = resp.status();
                    // Client errors are not retried: the request itself is
                    // wrong, not the network.
                    if status.is_client_error() {
                        return Err(CoreError::Validation(format!(
                            "rpc {path} to {peer} rejected: {status}"
                        )));
                    }
                    last_error =
                        CoreError::Transient(format!("rpc {path} to {peer} returned {status}"));
                }
                Err(e) => {
                    if e.is_timeout() {
                        stats.timeout.fetch_add(1, Ordering::Relaxed);
                    } else {
                        stats.failure.fetch_add(1, Ordering::Relaxed);
                    }
                    last_error = CoreError::Transient(format!("rpc {path} to {peer}: {e}"));
                }
            }

            if attempt + 1 < self.max_attempts {
                let delay = self.backoff_delay(attempt);
                debug!(peer = %peer, path = %path, attempt, delay_ms = delay.as_millis() as u64, "RPC retry");
                tokio::time::sleep(delay).await;
            }
        }
        warn!(peer = %peer, path = %path, error = %last_error, "RPC exhausted retries");
        Err(last_error)
    }
}

#[async_trait]
impl RaftTransport for HttpTransport {
    async fn request_vote(&self, peer: &str, req: &VoteRequest) -> CoreResult<VoteResponse> {
        self.post_with_retry(peer, "raft/request_vote", req).await
    }

    async fn append_entries(
        &self,
        peer: &str,
        req: &AppendEntriesRequest,
    ) -> CoreResult<AppendEntriesResponse> {
        self.post_with_retry(peer, "raft/append_entries", req).await
    }

    async fn install_snapshot(
        &self,
        peer: &str,
        req: &InstallSnapshotRequest,
    ) -> CoreResult<InstallSnapshotResponse> {
        self.post_with_retry(peer, "raft/install_snapshot", req).await
    }

    async fn data_sync_push(
        &self,
        peer: &str,
        req: &DataSyncPushRequest,
    ) -> CoreResult<DataSyncPushResponse> {
        self.post_with_retry(peer, "sync/push", req).await
    }

    async fn probe(&self, peer: &str) -> CoreResult<()> {
        let address = self.discovery.resolve(peer).await?;
        let url = format!("{}/api/v1/health", address.trim_end_matches('/'));
        let client = self.client_for(peer);
        let resp = client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("probe {peer}: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CoreError::Transient(format!(
                "probe {peer} returned {}",
                resp.status()
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// In-process loopback
// ---------------------------------------------------------------------------

/// Wires nodes together inside one process. A node that has been removed
/// from the registry behaves like a dead peer (connection error), which is
/// how the tests take nodes down.
#[derive(Default)]
pub struct LoopbackTransport {
    nodes: DashMap<String, Arc<RaftNode>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: Arc<RaftNode>) {
        self.nodes.insert(node.node_id().to_string(), node);
    }

    pub fn remove_node(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    fn node(&self, peer: &str) -> CoreResult<Arc<RaftNode>> {
        self.nodes
            .get(peer)
            .map(|n| n.clone())
            .ok_or_else(|| CoreError::Transient(format!("peer {peer} unreachable")))
    }
}

#[async_trait]
impl RaftTransport for LoopbackTransport {
    async fn request_vote(&self, peer: &str, req: &VoteRequest) -> CoreResult<VoteResponse> {
        Ok(self.node(peer)?.handle_vote_request(req))
    }

    async fn append_entries(
        &self,
        peer: &str,
        req: &AppendEntriesRequest,
    ) -> CoreResult<AppendEntriesResponse> {
        Ok(self.node(peer)?.handle_append_entries(req))
    }

    async fn install_snapshot(
        &self,
        peer: &str,
        req: &InstallSnapshotRequest,
    ) -> CoreResult<InstallSnapshotResponse> {
        Ok(self.node(peer)?.handle_install_snapshot(req))
    }

    async fn data_sync_push(
        &self,
        peer: &str,
        _req: &DataSyncPushRequest,
    ) -> CoreResult<DataSyncPushResponse> {
        // Loopback clusters replicate through the raft log; a push is a
        // no-op acknowledgement.
        self.node(peer)?;
        Ok(DataSyncPushResponse {
            accepted: 0,
            rejected: 0,
        })
    }

    async fn probe(&self, peer: &str) -> CoreResult<()> {
        self.node(peer).map(|_| ())
    }
}
