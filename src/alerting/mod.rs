//! Metric store and alert rule evaluation.
//!
//! Metrics live in bounded sliding windows; alert rules compare the most
//! recent value of a metric against a threshold on every evaluation tick.
//! An alert goes *active* on the first triggering observation and
//! *resolved* on the first non-triggering one; duplicate actives for the
//! same rule are suppressed.

use crate::ids;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Samples retained per metric name.
const METRIC_WINDOW: usize = 10_000;

/// Resolved alerts kept for the history endpoint.
const ALERT_HISTORY_CAP: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Unix seconds.
    pub timestamp: u64,
    pub kind: MetricKind,
}

impl Metric {
    pub fn gauge(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            labels: HashMap::new(),
            timestamp: ids::unix_secs(),
            kind: MetricKind::Gauge,
        }
    }

    pub fn counter(name: &str, value: f64) -> Self {
        Self {
            kind: MetricKind::Counter,
            ..Self::gauge(name, value)
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricStatistics {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

pub struct MetricsStore {
    retention: Duration,
    metrics: DashMap<String, VecDeque<Metric>>,
}

impl MetricsStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            metrics: DashMap::new(),
        }
    }

    pub fn record(&self, metric: Metric) {
        let mut window = self.metrics.entry(metric.name.clone()).or_default();
        if window.len() >= METRIC_WINDOW {
            window.pop_front();
        }
        let cutoff = metric.timestamp.saturating_sub(self.retention.as_secs());
        while window.front().is_some_and(|m| m.timestamp < cutoff) {
            window.pop_front();
        }
        window.push_back(metric);
    }

    /// Most recent value, optionally constrained to a label subset.
    pub fn latest(&self, name: &str, labels: Option<&HashMap<String, String>>) -> Option<f64> {
        let window = self.metrics.get(name)?;
        window
            .iter()
            .rev()
            .find(|m| {
                labels.map_or(true, |wanted| {
                    wanted.iter().all(|(k, v)| m.labels.get(k) == Some(v))
                })
            })
            .map(|m| m.value)
    }

    pub fn statistics(&self, name: &str, window_secs: u64) -> Option<MetricStatistics> {
        let window = self.metrics.get(name)?;
        let cutoff = ids::unix_secs().saturating_sub(window_secs);
        let values: Vec<f64> = window
            .iter()
            .filter(|m| m.timestamp >= cutoff)
            .map(|m| m.value)
            .collect();
        if values.is_empty() {
            return None;
        }
        Some(MetricStatistics {
            count: values.len(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            avg: values.iter().sum::<f64>() / values.len() as f64,
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

impl Comparison {
    pub fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Ge => value >= threshold,
            Self::Le => value <= threshold,
            Self::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub rule_id: String,
    pub name: String,
    pub metric_name: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: AlertSeverity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub alert_id: String,
    pub rule_id: String,
    pub name: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub metric_name: String,
    pub threshold: f64,
    pub current_value: f64,
    pub triggered_at: u64,
    pub resolved: bool,
    pub resolved_at: Option<u64>,
}

pub struct AlertManager {
    store: Arc<MetricsStore>,
    rules: DashMap<String, AlertRule>,
    active: DashMap<String, Alert>,
    history: Mutex<VecDeque<Alert>>,
    idgen: crate::ids::IdGen,
}

impl AlertManager {
    pub fn new(store: Arc<MetricsStore>) -> Self {
        Self {
            store,
            rules: DashMap::new(),
            active: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(ALERT_HISTORY_CAP)),
            idgen: crate::ids::IdGen::new(),
        }
    }

    pub fn add_rule(&self, rule: AlertRule) {
        info!(rule_id = %rule.rule_id, metric = %rule.metric_name, "Alert rule added");
        self.rules.insert(rule.rule_id.clone(), rule);
    }

    pub fn remove_rule(&self, rule_id: &str) {
        self.rules.remove(rule_id);
        self.active.remove(rule_id);
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        let mut all: Vec<AlertRule> = self.rules.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        all
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut all: Vec<Alert> = self.active.iter().map(|a| a.clone()).collect();
        all.sort_by(|a, b| a.alert_id.cmp(&b.alert_id));
        all
    }

    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        self.history
            .lock()
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// One evaluation pass over every enabled rule.
    pub fn evaluate_tick(&self) {
        for rule in self.rules.iter() {
            if !rule.enabled {
                continue;
            }
            let Some(value) = self.store.latest(&rule.metric_name, None) else {
                continue;
            };
            let triggering = rule.comparison.evaluate(value, rule.threshold);

            if triggering {
                // Duplicate actives for the same rule are suppressed.
                if self.active.contains_key(&rule.rule_id) {
                    continue;
                }
                let alert = Alert {
                    alert_id: self.idgen.next("alert"),
                    rule_id: rule.rule_id.clone(),
                    name: rule.name.clone(),
                    severity: rule.severity,
                    message: format!(
                        "{}: {} = {value} breaches threshold {}",
                        rule.name, rule.metric_name, rule.threshold
                    ),
                    metric_name: rule.metric_name.clone(),
                    threshold: rule.threshold,
                    current_value: value,
                    triggered_at: ids::unix_secs(),
                    resolved: false,
                    resolved_at: None,
                };
                warn!(
                    rule_id = %rule.rule_id,
                    metric = %rule.metric_name,
                    value,
                    threshold = rule.threshold,
                    severity = ?rule.severity,
                    "Alert active"
                );
                self.active.insert(rule.rule_id.clone(), alert);
            } else if let Some((_, mut alert)) = self.active.remove(&rule.rule_id) {
                alert.resolved = true;
                alert.resolved_at = Some(ids::unix_secs());
                info!(rule_id = %rule.rule_id, "Alert resolved");
                if let Ok(mut history) = self.history.lock() {
                    if history.len() >= ALERT_HISTORY_CAP {
                        history.pop_front();
                    }
                    history.push_back(alert);
                }
            }
        }
    }

    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval =
            Duration::from_secs(crate::config::get().alerting.check_interval_secs);
        info!(interval_secs = interval.as_secs(), "Alert evaluation loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Alert evaluation loop stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    self.evaluate_tick();
                    debug!(active = self.active.len(), "Alert tick complete");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<MetricsStore>, AlertManager) {
        let store = Arc::new(MetricsStore::new(Duration::from_secs(3600)));
        let mgr = AlertManager::new(store.clone());
        (store, mgr)
    }

    fn cpu_rule() -> AlertRule {
        AlertRule {
            rule_id: "cpu-high".into(),
            name: "High CPU".into(),
            metric_name: "cpu_percent".into(),
            comparison: Comparison::Gt,
            threshold: 80.0,
            severity: AlertSeverity::Warning,
            enabled: true,
        }
    }

    #[test]
    fn test_metric_latest_and_statistics() {
        let store = MetricsStore::new(Duration::from_secs(3600));
        store.record(Metric::gauge("cpu_percent", 10.0));
        store.record(Metric::gauge("cpu_percent", 30.0));
        store.record(Metric::gauge("cpu_percent", 20.0));

        assert_eq!(store.latest("cpu_percent", None), Some(20.0));
        let stats = store.statistics("cpu_percent", 3600).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
        assert!((stats.avg - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_latest_with_labels() {
        let store = MetricsStore::new(Duration::from_secs(3600));
        store.record(Metric::gauge("battery", 90.0).with_label("uav", "u1"));
        store.record(Metric::gauge("battery", 40.0).with_label("uav", "u2"));

        let mut want = HashMap::new();
        want.insert("uav".to_string(), "u1".to_string());
        assert_eq!(store.latest("battery", Some(&want)), Some(90.0));
        assert_eq!(store.latest("battery", None), Some(40.0));
    }

    #[test]
    fn test_alert_activates_once_and_resolves() {
        let (store, mgr) = manager();
        mgr.add_rule(cpu_rule());

        store.record(Metric::gauge("cpu_percent", 95.0));
        mgr.evaluate_tick();
        assert_eq!(mgr.active_alerts().len(), 1);

        // Still triggering: duplicate suppressed.
        store.record(Metric::gauge("cpu_percent", 97.0));
        mgr.evaluate_tick();
        assert_eq!(mgr.active_alerts().len(), 1);

        // First non-triggering observation resolves.
        store.record(Metric::gauge("cpu_percent", 40.0));
        mgr.evaluate_tick();
        assert!(mgr.active_alerts().is_empty());

        let history = mgr.alert_history(10);
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved);
        assert!(history[0].resolved_at.is_some());
    }

    #[test]
    fn test_disabled_rule_is_ignored() {
        let (store, mgr) = manager();
        let mut rule = cpu_rule();
        rule.enabled = false;
        mgr.add_rule(rule);

        store.record(Metric::gauge("cpu_percent", 95.0));
        mgr.evaluate_tick();
        assert!(mgr.active_alerts().is_empty());
    }

    #[test]
    fn test_missing_metric_no_alert() {
        let (_store, mgr) = manager();
        mgr.add_rule(cpu_rule());
        mgr.evaluate_tick();
        assert!(mgr.active_alerts().is_empty());
    }

    #[test]
    fn test_comparisons() {
        assert!(Comparison::Gt.evaluate(2.0, 1.0));
        assert!(!Comparison::Gt.evaluate(1.0, 1.0));
        assert!(Comparison::Ge.evaluate(1.0, 1.0));
        assert!(Comparison::Lt.evaluate(0.5, 1.0));
        assert!(Comparison::Le.evaluate(1.0, 1.0));
        assert!(Comparison::Eq.evaluate(1.0, 1.0));
        assert!(!Comparison::Eq.evaluate(1.1, 1.0));
    }

    #[test]
    fn test_comparison_wire_form() {
        let rule: AlertRule = serde_json::from_value(serde_json::json!({
            "rule_id": "r1",
            "name": "n",
            "metric_name": "m",
            "comparison": ">=",
            "threshold": 5.0,
            "severity": "ERROR",
        }))
        .unwrap();
        assert_eq!(rule.comparison, Comparison::Ge);
        assert_eq!(rule.severity, AlertSeverity::Error);
    }

    #[test]
    fn test_metric_window_bounded() {
        let store = MetricsStore::new(Duration::from_secs(3600));
        for i in 0..(METRIC_WINDOW + 100) {
            store.record(Metric::gauge("x", i as f64));
        }
        let window = store.metrics.get("x").unwrap();
        assert_eq!(window.len(), METRIC_WINDOW);
    }
}
