//! Autoscaler: rolling metric windows, cooldown-guarded scale decisions.
//!
//! The scaler only ever *decides*; adding and removing nodes happens
//! through injected callbacks, so it can drive a container orchestrator,
//! a cloud API, or a test double without knowing which.

use crate::ids;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Samples retained per node.
const WINDOW_SIZE: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub node_id: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub active_missions: usize,
    pub pending_missions: usize,
    /// Unix seconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
}

impl ScalingPolicy {
    pub fn from_config() -> Self {
        let cfg = &crate::config::get().autoscale;
        Self {
            min_nodes: cfg.min_nodes,
            max_nodes: cfg.max_nodes,
            scale_up_threshold: cfg.scale_up_threshold,
            scale_down_threshold: cfg.scale_down_threshold,
            scale_up_cooldown: Duration::from_secs(cfg.scale_up_cooldown_secs),
            scale_down_cooldown: Duration::from_secs(cfg.scale_down_cooldown_secs),
        }
    }
}

/// Add `n` nodes; returns whether the request was accepted.
pub type ScaleUpFn = Arc<dyn Fn(usize) -> bool + Send + Sync>;
/// Remove the named nodes; returns whether the request was accepted.
pub type ScaleDownFn = Arc<dyn Fn(&[String]) -> bool + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct ScalingRecord {
    pub action: ScalingAction,
    pub node_delta: usize,
    pub node_ids: Vec<String>,
    pub timestamp: u64,
}

struct ScalerState {
    windows: HashMap<String, VecDeque<NodeMetrics>>,
    last_scale_up: Option<u64>,
    last_scale_down: Option<u64>,
    history: Vec<ScalingRecord>,
}

pub struct AutoScaler {
    policy: ScalingPolicy,
    state: Mutex<ScalerState>,
    scale_up: ScaleUpFn,
    scale_down: ScaleDownFn,
}

impl AutoScaler {
    pub fn new(policy: ScalingPolicy, scale_up: ScaleUpFn, scale_down: ScaleDownFn) -> Self {
        Self {
            policy,
            state: Mutex::new(ScalerState {
                windows: HashMap::new(),
                last_scale_up: None,
                last_scale_down: None,
                history: Vec::new(),
            }),
            scale_up,
            scale_down,
        }
    }

    pub fn record_metrics(&self, metrics: NodeMetrics) {
        if let Ok(mut state) = self.state.lock() {
            let window = state
                .windows
                .entry(metrics.node_id.clone())
                .or_insert_with(|| VecDeque::with_capacity(WINDOW_SIZE));
            if window.len() >= WINDOW_SIZE {
                window.pop_front();
            }
            window.push_back(metrics);
        }
    }

    pub fn history(&self, limit: usize) -> Vec<ScalingRecord> {
        self.state
            .lock()
            .map(|s| s.history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Evaluate the policy against the current windows.
    pub fn evaluate(&self, current_nodes: usize, now_secs: u64) -> ScalingAction {
        let Ok(state) = self.state.lock() else {
            return ScalingAction::NoAction;
        };
        if state.windows.is_empty() {
            return ScalingAction::NoAction;
        }

        // Latest sample per node for mission counts; window means for
        // cpu/memory.
        let mut cpu_sum = 0.0;
        let mut mem_sum = 0.0;
        let mut samples = 0usize;
        let mut pending_total = 0usize;
        let mut active_total = 0usize;
        for window in state.windows.values() {
            for m in window {
                cpu_sum += m.cpu_percent;
                mem_sum += m.memory_percent;
                samples += 1;
            }
            if let Some(latest) = window.back() {
                pending_total += latest.pending_missions;
                active_total += latest.active_missions;
            }
        }
        if samples == 0 {
            return ScalingAction::NoAction;
        }
        let avg_cpu = cpu_sum / samples as f64;
        let avg_mem = mem_sum / samples as f64;

        let up_ready = state.last_scale_up.map_or(true, |t| {
            now_secs.saturating_sub(t) >= self.policy.scale_up_cooldown.as_secs()
        }) && current_nodes < self.policy.max_nodes;
        let down_ready = state.last_scale_down.map_or(true, |t| {
            now_secs.saturating_sub(t) >= self.policy.scale_down_cooldown.as_secs()
        }) && current_nodes > self.policy.min_nodes;

        if up_ready
            && (avg_cpu > self.policy.scale_up_threshold
                || avg_mem > self.policy.scale_up_threshold
                || pending_total > current_nodes * 2)
        {
            return ScalingAction::ScaleUp;
        }

        if down_ready
            && avg_cpu < self.policy.scale_down_threshold
            && avg_mem < self.policy.scale_down_threshold
            && pending_total == 0
            && active_total < current_nodes
        {
            return ScalingAction::ScaleDown;
        }

        ScalingAction::NoAction
    }

    /// The least loaded node, by latest cpu + memory sample.
    fn pick_scale_down_victim(&self) -> Option<String> {
        let state = self.state.lock().ok()?;
        state
            .windows
            .iter()
            .filter_map(|(node_id, window)| {
                window
                    .back()
                    .map(|m| (node_id.clone(), m.cpu_percent + m.memory_percent))
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(node_id, _)| node_id)
    }

    /// Evaluate and, when warranted, fire the matching callback.
    pub fn check_and_scale(&self, current_nodes: usize) -> ScalingAction {
        let now = ids::unix_secs();
        let action = self.evaluate(current_nodes, now);
        match action {
            ScalingAction::ScaleUp => {
                info!(current_nodes, "Scaling up by one node");
                if (self.scale_up)(1) {
                    if let Ok(mut state) = self.state.lock() {
                        state.last_scale_up = Some(now);
                        state.history.push(ScalingRecord {
                            action,
                            node_delta: 1,
                            node_ids: Vec::new(),
                            timestamp: now,
                        });
                    }
                } else {
                    warn!("Scale-up callback rejected the request");
                }
            }
            ScalingAction::ScaleDown => {
                let Some(victim) = self.pick_scale_down_victim() else {
                    return ScalingAction::NoAction;
                };
                info!(node_id = %victim, "Scaling down one node");
                let victims = vec![victim];
                if (self.scale_down)(&victims) {
                    if let Ok(mut state) = self.state.lock() {
                        state.last_scale_down = Some(now);
                        for v in &victims {
                            state.windows.remove(v);
                        }
                        state.history.push(ScalingRecord {
                            action,
                            node_delta: 1,
                            node_ids: victims,
                            timestamp: now,
                        });
                    }
                } else {
                    warn!("Scale-down callback rejected the request");
                }
            }
            ScalingAction::NoAction => {}
        }
        action
    }

    /// Periodic evaluation loop; `node_count` supplies the current
    /// cluster size.
    pub async fn run_loop(
        self: Arc<Self>,
        node_count: Arc<dyn Fn() -> usize + Send + Sync>,
        cancel: CancellationToken,
    ) {
        let interval = Duration::from_secs(30);
        info!("Autoscaler loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Autoscaler loop stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    let action = self.check_and_scale(node_count());
                    if action != ScalingAction::NoAction {
                        debug!(action = ?action, "Autoscale action taken");
                    }
                }
            }
        }
    }
}
