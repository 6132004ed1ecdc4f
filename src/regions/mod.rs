//! Cross-region replication.
//!
//! Every replicated entity change fans out to the configured peer regions
//! through an async queue. Workers drain the queue in small batches and
//! push over HTTP with per-operation retries; a region whose failure rate
//! crosses 50% over at least 20 attempts is marked unhealthy and skipped
//! until its cooldown expires.

use crate::error::{CoreError, CoreResult};
use crate::ids;
use crate::types::{EntityKind, SyncOpKind};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Concurrent batch drained per worker pass.
const REGION_BATCH: usize = 5;

/// Attempts before the failure-rate gate can trip.
const HEALTH_MIN_ATTEMPTS: u64 = 20;

/// How long an unhealthy region is skipped before re-probing.
const UNHEALTHY_COOLDOWN: Duration = Duration::from_secs(60);

/// Per-operation retry budget.
const OP_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub region_id: String,
    pub region_name: String,
    pub endpoint: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSyncOp {
    pub operation_id: String,
    pub source_region: String,
    pub target_region: String,
    pub op: SyncOpKind,
    pub entity: EntityKind,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

#[derive(Debug, Default)]
struct RegionCounters {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    latency_ms_sum: AtomicU64,
    last_sync_secs: AtomicU64,
    /// Unix seconds until which the region is skipped; 0 = healthy.
    skip_until: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionStats {
    pub region_id: String,
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub avg_latency_ms: f64,
    pub last_sync_secs: Option<u64>,
    pub healthy: bool,
}

pub struct CrossRegionSync {
    local_region: String,
    regions: DashMap<String, RegionConfig>,
    counters: DashMap<String, Arc<RegionCounters>>,
    queue: Mutex<VecDeque<RegionSyncOp>>,
    http: reqwest::Client,
}

impl CrossRegionSync {
    pub fn new(local_region: &str) -> Self {
        Self {
            local_region: local_region.to_string(),
            regions: DashMap::new(),
            counters: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn register_region(&self, config: RegionConfig) {
        info!(
            region_id = %config.region_id,
            endpoint = %config.endpoint,
            priority = config.priority,
            "Peer region registered"
        );
        self.counters
            .entry(config.region_id.clone())
            .or_insert_with(|| Arc::new(RegionCounters::default()));
        self.regions.insert(config.region_id.clone(), config);
    }

    pub fn list_regions(&self) -> Vec<RegionConfig> {
        let mut all: Vec<RegionConfig> = self.regions.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.region_id.cmp(&b.region_id)));
        all
    }

    fn counters_for(&self, region_id: &str) -> Arc<RegionCounters> {
        self.counters
            .entry(region_id.to_string())
            .or_insert_with(|| Arc::new(RegionCounters::default()))
            .clone()
    }

    fn is_skipped(&self, region_id: &str, now_secs: u64) -> bool {
        self.counters_for(region_id).skip_until.load(Ordering::Relaxed) > now_secs
    }

    /// Queue one entity change for every enabled peer region.
    pub async fn enqueue_change(
        &self,
        op: SyncOpKind,
        entity: EntityKind,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> usize {
        let now = ids::unix_secs();
        let mut queued = 0;
        let mut queue = self.queue.lock().await;
        for region in self.regions.iter() {
            if !region.enabled || region.region_id == self.local_region {
                continue;
            }
            queue.push_back(RegionSyncOp {
                operation_id: uuid::Uuid::new_v4().to_string(),
                source_region: self.local_region.clone(),
                target_region: region.region_id.clone(),
                op,
                entity,
                entity_id: entity_id.to_string(),
                payload: payload.clone(),
                timestamp: now,
            });
            queued += 1;
        }
        queued
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn stats(&self) -> Vec<RegionStats> {
        let now = ids::unix_secs();
        let mut out: Vec<RegionStats> = self
            .counters
            .iter()
            .map(|entry| {
                let c = entry.value();
                let total = c.total.load(Ordering::Relaxed);
                let success = c.success.load(Ordering::Relaxed);
                let last = c.last_sync_secs.load(Ordering::Relaxed);
                RegionStats {
                    region_id: entry.key().clone(),
                    total_syncs: total,
                    successful_syncs: success,
                    failed_syncs: c.failed.load(Ordering::Relaxed),
                    avg_latency_ms: if success == 0 {
                        0.0
                    } else {
                        c.latency_ms_sum.load(Ordering::Relaxed) as f64 / success as f64
                    },
                    last_sync_secs: (last > 0).then_some(last),
                    healthy: c.skip_until.load(Ordering::Relaxed) <= now,
                }
            })
            .collect();
        out.sort_by(|a, b| a.region_id.cmp(&b.region_id));
        out
    }

    async fn push_once(&self, op: &RegionSyncOp) -> CoreResult<()> {
        let region = self
            .regions
            .get(&op.target_region)
            .map(|r| r.clone())
            .ok_or_else(|| CoreError::NotFound(format!("region {}", op.target_region)))?;

        let url = format!("{}/sync/push", region.endpoint.trim_end_matches('/'));
        let body = serde_json::json!({
            "origin": self.local_region,
            "operations": [op],
        });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("region push: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CoreError::Transient(format!(
                "region {} returned {}",
                op.target_region,
                resp.status()
            )))
        }
    }

    /// Deliver one operation with retries, then settle the region health.
    async fn deliver(&self, op: RegionSyncOp) {
        let now = ids::unix_secs();
        if self.is_skipped(&op.target_region, now) {
            debug!(region = %op.target_region, "Region unhealthy, sync skipped");
            return;
        }

        let counters = self.counters_for(&op.target_region);
        let start = std::time::Instant::now();
        let mut outcome = Err(CoreError::Transient("never attempted".into()));

        for attempt in 0..OP_MAX_ATTEMPTS {
            counters.total.fetch_add(1, Ordering::Relaxed);
            outcome = self.push_once(&op).await;
            match &outcome {
                Ok(()) => {
                    counters.success.fetch_add(1, Ordering::Relaxed);
                    counters
                        .latency_ms_sum
                        .fetch_add(start.elapsed().as_millis() as u64, Ordering::Relaxed);
                    counters
                        .last_sync_secs
                        .store(ids::unix_secs(), Ordering::Relaxed);
                    break;
                }
                Err(_) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    if attempt + 1 < OP_MAX_ATTEMPTS {
                        let delay = ids::with_jitter(
                            Duration::from_millis(200 * 2u64.pow(attempt)),
                            0.1,
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        if let Err(e) = outcome {
            warn!(
                region = %op.target_region,
                entity_id = %op.entity_id,
                error = %e,
                "Cross-region sync failed"
            );
        }

        // Health gate: > 50% failures over at least 20 attempts.
        let total = counters.total.load(Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);
        if total >= HEALTH_MIN_ATTEMPTS && failed * 2 > total {
            let until = ids::unix_secs() + UNHEALTHY_COOLDOWN.as_secs();
            counters.skip_until.store(until, Ordering::Relaxed);
            warn!(
                region = %op.target_region,
                failed,
                total,
                cooldown_secs = UNHEALTHY_COOLDOWN.as_secs(),
                "Region marked unhealthy"
            );
        }
    }

    /// Queue worker: drain batches of at most five, concurrently.
    pub async fn run_worker(self: Arc<Self>, cancel: CancellationToken) {
        info!(local_region = %self.local_region, "Cross-region sync worker started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Cross-region sync worker stopped");
                    return;
                }
                () = tokio::time::sleep(Duration::from_millis(500)) => {
                    let batch: Vec<RegionSyncOp> = {
                        let mut queue = self.queue.lock().await;
                        let take = queue.len().min(REGION_BATCH);
                        queue.drain(..take).collect()
                    };
                    if batch.is_empty() {
                        continue;
                    }
                    futures::future::join_all(
                        batch.into_iter().map(|op| self.deliver(op)),
                    )
                    .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: &str, enabled: bool) -> RegionConfig {
        RegionConfig {
            region_id: id.into(),
            region_name: id.into(),
            endpoint: format!("http://{id}.invalid:1"),
            priority: 0,
            enabled,
        }
    }

    #[tokio::test]
    async fn test_enqueue_fans_out_to_enabled_peers() {
        let sync = CrossRegionSync::new("region-a");
        sync.register_region(region("region-a", true)); // local: skipped
        sync.register_region(region("region-b", true));
        sync.register_region(region("region-c", true));
        sync.register_region(region("region-d", false)); // disabled

        let queued = sync
            .enqueue_change(
                SyncOpKind::Update,
                EntityKind::Mission,
                "m1",
                serde_json::json!({"x": 1}),
            )
            .await;
        assert_eq!(queued, 2);
        assert_eq!(sync.queue_depth().await, 2);
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let sync = CrossRegionSync::new("region-a");
        let mut low = region("low", true);
        low.priority = 1;
        let mut high = region("high", true);
        high.priority = 9;
        sync.register_region(low);
        sync.register_region(high);
        let regions = sync.list_regions();
        assert_eq!(regions[0].region_id, "high");
    }

    #[test]
    fn test_health_gate_thresholds() {
        let sync = CrossRegionSync::new("region-a");
        let counters = sync.counters_for("region-b");

        // 19 attempts, all failed: not enough attempts to trip.
        counters.total.store(19, Ordering::Relaxed);
        counters.failed.store(19, Ordering::Relaxed);
        let total = counters.total.load(Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);
        assert!(!(total >= HEALTH_MIN_ATTEMPTS && failed * 2 > total));

        // 20 attempts, 11 failed: trips.
        counters.total.store(20, Ordering::Relaxed);
        counters.failed.store(11, Ordering::Relaxed);
        let total = counters.total.load(Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);
        assert!(total >= HEALTH_MIN_ATTEMPTS && failed * 2 > total);

        // Exactly 50%: does not trip.
        counters.failed.store(10, Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);
        assert!(!(failed * 2 > total));
    }

    #[test]
    fn test_skip_window() {
        let sync = CrossRegionSync::new("region-a");
        let counters = sync.counters_for("region-b");
        let now = ids::unix_secs();
        counters.skip_until.store(now + 60, Ordering::Relaxed);
        assert!(sync.is_skipped("region-b", now));
        assert!(!sync.is_skipped("region-b", now + 61));
    }

    #[test]
    fn test_stats_shape() {
        let sync = CrossRegionSync::new("region-a");
        sync.register_region(region("region-b", true));
        let stats = sync.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].region_id, "region-b");
        assert!(stats[0].healthy);
        assert_eq!(stats[0].total_syncs, 0);
        assert!(stats[0].last_sync_secs.is_none());
    }
}
