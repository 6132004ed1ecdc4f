//! Mission retry policy.
//!
//! Decides whether, when, and how often a failed mission is re-attempted.
//! The decision combines three inputs:
//! - the mission profile (a TRANSPORT run gets fewer attempts than an
//!   INSPECTION sweep),
//! - the class of the last error (auth and validation failures are never
//!   retried; rate-limit errors wait at least five seconds),
//! - the rolling success history per profile, which nudges the attempt
//!   budget up when a profile keeps failing and down when it almost
//!   always succeeds.
//!
//! Retries consume nothing but their own per-mission counter.

use crate::types::MissionProfile;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryPolicy {
    None,
    Immediate,
    FixedInterval,
    ExponentialBackoff,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub policy: RetryPolicy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            policy: RetryPolicy::ExponentialBackoff,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

/// Classification of the failure that terminated a mission or RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Network,
    Timeout,
    Server,
    Client,
    RateLimit,
    Auth,
    Validation,
    Unknown,
}

impl ErrorClass {
    /// Classes that must never be retried.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Auth | Self::Validation)
    }

    /// Best-effort classification from an error message.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") {
            return Self::RateLimit;
        }
        if lower.contains("401") || lower.contains("403") || lower.contains("unauthorized") {
            return Self::Auth;
        }
        if lower.contains("validation") || lower.contains("422") {
            return Self::Validation;
        }
        if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
            return Self::Timeout;
        }
        if lower.contains("connection")
            || lower.contains("network")
            || lower.contains("unreachable")
            || lower.contains("refused")
        {
            return Self::Network;
        }
        if ["500", "502", "503", "504"].iter().any(|c| lower.contains(c)) {
            return Self::Server;
        }
        if ["400", "404", "409"].iter().any(|c| lower.contains(c)) {
            return Self::Client;
        }
        Self::Unknown
    }
}

#[derive(Debug, Clone)]
struct RetryRecord {
    attempts: u32,
    next_retry_at: Option<u64>,
    profile: MissionProfile,
}

/// Per-profile outcome ring used for adaptive tuning.
const HISTORY_WINDOW: usize = 1000;

#[derive(Default)]
struct ProfileHistory {
    outcomes: VecDeque<bool>,
}

impl ProfileHistory {
    fn record(&mut self, success: bool) {
        if self.outcomes.len() >= HISTORY_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn success_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let ok = self.outcomes.iter().filter(|&&s| s).count();
        Some(ok as f64 / self.outcomes.len() as f64)
    }
}

pub struct RetryManager {
    records: Mutex<HashMap<String, RetryRecord>>,
    history: Mutex<HashMap<MissionProfile, ProfileHistory>>,
    /// Fraction of the computed delay added as uniform random jitter.
    jitter_fraction: f64,
}

impl RetryManager {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            jitter_fraction: 0.1,
        }
    }

    /// Profile-specific baseline configuration.
    fn profile_config(profile: MissionProfile) -> RetryConfig {
        match profile {
            MissionProfile::Search => RetryConfig {
                max_retries: 3,
                policy: RetryPolicy::ExponentialBackoff,
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(60),
                backoff_multiplier: 2.0,
            },
            MissionProfile::Patrol => RetryConfig {
                max_retries: 5,
                policy: RetryPolicy::ExponentialBackoff,
                initial_delay: Duration::from_secs(3),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 2.0,
            },
            MissionProfile::Transport => RetryConfig {
                max_retries: 2,
                policy: RetryPolicy::FixedInterval,
                initial_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(60),
                backoff_multiplier: 1.0,
            },
            MissionProfile::Inspection => RetryConfig {
                max_retries: 4,
                policy: RetryPolicy::ExponentialBackoff,
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(120),
                backoff_multiplier: 2.0,
            },
            MissionProfile::Other => RetryConfig::default(),
        }
    }

    /// The effective configuration after error-class gating and adaptive
    /// success-rate tuning.
    pub fn effective_config(
        &self,
        profile: MissionProfile,
        error_class: ErrorClass,
    ) -> Option<RetryConfig> {
        if !error_class.is_retryable() {
            return None;
        }
        let mut config = Self::profile_config(profile);

        // Rate-limited failures must not hammer the target.
        if error_class == ErrorClass::RateLimit && config.initial_delay < Duration::from_secs(5) {
            config.initial_delay = Duration::from_secs(5);
        }

        if let Ok(history) = self.history.lock() {
            if let Some(rate) = history.get(&profile).and_then(ProfileHistory::success_rate) {
                if rate < 0.5 {
                    config.max_retries = (config.max_retries + 1).min(10);
                    debug!(
                        profile = ?profile,
                        success_rate = rate,
                        max_retries = config.max_retries,
                        "Low success rate, raising retry budget"
                    );
                } else if rate > 0.9 && config.max_retries > 1 {
                    config.max_retries -= 1;
                }
            }
        }
        Some(config)
    }

    fn compute_delay(&self, config: &RetryConfig, attempt: u32) -> Duration {
        let base = match config.policy {
            RetryPolicy::None | RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::FixedInterval => config.initial_delay,
            RetryPolicy::ExponentialBackoff => {
                let factor = config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
                let delay = config.initial_delay.as_secs_f64() * factor;
                Duration::from_secs_f64(delay.min(config.max_delay.as_secs_f64()))
            }
        };
        if base.is_zero() {
            return base;
        }
        let jitter = base.as_secs_f64() * self.jitter_fraction * rand::thread_rng().gen::<f64>();
        base + Duration::from_secs_f64(jitter)
    }

    /// Schedule a retry for a failed mission. Returns the unix-seconds
    /// instant of the next attempt, or `None` when the mission is out of
    /// budget or the error class forbids retrying.
    pub fn schedule(
        &self,
        mission_id: &str,
        profile: MissionProfile,
        error_class: ErrorClass,
        now_secs: u64,
    ) -> Option<u64> {
        let config = self.effective_config(profile, error_class)?;

        let mut records = self.records.lock().ok()?;
        let record = records.entry(mission_id.to_string()).or_insert(RetryRecord {
            attempts: 0,
            next_retry_at: None,
            profile,
        });

        if record.attempts >= config.max_retries {
            info!(
                mission_id = %mission_id,
                attempts = record.attempts,
                "Retry budget exhausted"
            );
            return None;
        }

        record.attempts += 1;
        let delay = self.compute_delay(&config, record.attempts);
        let at = now_secs + delay.as_secs();
        record.next_retry_at = Some(at);
        info!(
            mission_id = %mission_id,
            attempt = record.attempts,
            max = config.max_retries,
            delay_secs = delay.as_secs(),
            "Retry scheduled"
        );
        Some(at)
    }

    /// Missions whose retry time has arrived. Each is returned once.
    pub fn due(&self, now_secs: u64) -> Vec<String> {
        let Ok(mut records) = self.records.lock() else {
            return Vec::new();
        };
        let mut due = Vec::new();
        for (mission_id, record) in records.iter_mut() {
            if let Some(at) = record.next_retry_at {
                if now_secs >= at {
                    record.next_retry_at = None;
                    due.push(mission_id.clone());
                }
            }
        }
        due.sort();
        due
    }

    /// Record the outcome of an attempt. A success clears the per-mission
    /// counter.
    pub fn record_outcome(&self, mission_id: &str, profile: MissionProfile, success: bool) {
        if let Ok(mut history) = self.history.lock() {
            history.entry(profile).or_default().record(success);
        }
        if success {
            if let Ok(mut records) = self.records.lock() {
                records.remove(mission_id);
            }
        }
    }

    pub fn attempts(&self, mission_id: &str) -> u32 {
        self.records
            .lock()
            .ok()
            .and_then(|r| r.get(mission_id).map(|rec| rec.attempts))
            .unwrap_or(0)
    }

    /// Drop stale records (terminal missions older than the horizon).
    pub fn cleanup(&self, now_secs: u64, max_age: Duration) {
        if let Ok(mut records) = self.records.lock() {
            records.retain(|_, record| {
                record
                    .next_retry_at
                    .map_or(true, |at| now_secs.saturating_sub(at) < max_age.as_secs())
            });
        }
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_and_validation_never_retry() {
        let mgr = RetryManager::new();
        assert!(mgr
            .schedule("m1", MissionProfile::Search, ErrorClass::Auth, 100)
            .is_none());
        assert!(mgr
            .schedule("m1", MissionProfile::Search, ErrorClass::Validation, 100)
            .is_none());
        assert_eq!(mgr.attempts("m1"), 0);
    }

    #[test]
    fn test_budget_is_per_mission() {
        let mgr = RetryManager::new();
        // TRANSPORT allows 2 attempts.
        assert!(mgr
            .schedule("m1", MissionProfile::Transport, ErrorClass::Network, 100)
            .is_some());
        assert!(mgr
            .schedule("m1", MissionProfile::Transport, ErrorClass::Network, 200)
            .is_some());
        assert!(mgr
            .schedule("m1", MissionProfile::Transport, ErrorClass::Network, 300)
            .is_none());

        // A different mission has its own budget.
        assert!(mgr
            .schedule("m2", MissionProfile::Transport, ErrorClass::Network, 300)
            .is_some());
    }

    #[test]
    fn test_exponential_delay_grows_and_caps() {
        let mgr = RetryManager::new();
        let config = RetryConfig {
            max_retries: 10,
            policy: RetryPolicy::ExponentialBackoff,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        };
        let d1 = mgr.compute_delay(&config, 1);
        let d2 = mgr.compute_delay(&config, 2);
        let d5 = mgr.compute_delay(&config, 5);

        // Jitter adds at most 10%.
        assert!(d1 >= Duration::from_secs(5) && d1 <= Duration::from_secs_f64(5.5));
        assert!(d2 >= Duration::from_secs(10) && d2 <= Duration::from_secs(11));
        assert!(d5 >= Duration::from_secs(60) && d5 <= Duration::from_secs(66));
    }

    #[test]
    fn test_due_returns_each_mission_once() {
        let mgr = RetryManager::new();
        mgr.schedule("m1", MissionProfile::Other, ErrorClass::Timeout, 100);

        let far_future = 100 + 1000;
        let due = mgr.due(far_future);
        assert_eq!(due, vec!["m1".to_string()]);
        assert!(mgr.due(far_future).is_empty());
    }

    #[test]
    fn test_success_clears_counter() {
        let mgr = RetryManager::new();
        mgr.schedule("m1", MissionProfile::Other, ErrorClass::Timeout, 100);
        assert_eq!(mgr.attempts("m1"), 1);

        mgr.record_outcome("m1", MissionProfile::Other, true);
        assert_eq!(mgr.attempts("m1"), 0);
    }

    #[test]
    fn test_adaptive_budget_raises_on_low_success() {
        let mgr = RetryManager::new();
        for _ in 0..20 {
            mgr.record_outcome("x", MissionProfile::Search, false);
        }
        let config = mgr
            .effective_config(MissionProfile::Search, ErrorClass::Network)
            .unwrap();
        // Baseline for SEARCH is 3; low success rate adds one.
        assert_eq!(config.max_retries, 4);
    }

    #[test]
    fn test_adaptive_budget_lowers_on_high_success() {
        let mgr = RetryManager::new();
        for _ in 0..20 {
            mgr.record_outcome("x", MissionProfile::Search, true);
        }
        let config = mgr
            .effective_config(MissionProfile::Search, ErrorClass::Network)
            .unwrap();
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn test_rate_limit_minimum_delay() {
        let mgr = RetryManager::new();
        let config = mgr
            .effective_config(MissionProfile::Patrol, ErrorClass::RateLimit)
            .unwrap();
        assert!(config.initial_delay >= Duration::from_secs(5));
    }

    #[test]
    fn test_classification() {
        assert_eq!(ErrorClass::classify("connection refused"), ErrorClass::Network);
        assert_eq!(ErrorClass::classify("request timed out"), ErrorClass::Timeout);
        assert_eq!(ErrorClass::classify("HTTP 503 unavailable"), ErrorClass::Server);
        assert_eq!(ErrorClass::classify("429 too many requests"), ErrorClass::RateLimit);
        assert_eq!(ErrorClass::classify("401 unauthorized"), ErrorClass::Auth);
        assert_eq!(ErrorClass::classify("validation failed: lat"), ErrorClass::Validation);
        assert_eq!(ErrorClass::classify("404 not found"), ErrorClass::Client);
        assert_eq!(ErrorClass::classify("weird"), ErrorClass::Unknown);
    }

    #[test]
    fn test_transport_fewer_retries_than_inspection() {
        let transport = RetryManager::profile_config(MissionProfile::Transport);
        let inspection = RetryManager::profile_config(MissionProfile::Inspection);
        assert!(transport.max_retries < inspection.max_retries);
    }
}
