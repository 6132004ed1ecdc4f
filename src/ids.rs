//! Timestamps, jitter, and monotonic unique identifiers.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch.
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Uniform random duration in `[base, base + fraction * base)`.
///
/// Used for election timeouts and retry backoff so that competing nodes
/// do not fire in lockstep.
pub fn with_jitter(base: Duration, fraction: f64) -> Duration {
    let extra = base.as_secs_f64() * fraction * rand::thread_rng().gen::<f64>();
    base + Duration::from_secs_f64(extra)
}

/// Uniform random duration in `[min, max)`.
pub fn uniform_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_secs_f64();
    min + Duration::from_secs_f64(rand::thread_rng().gen::<f64>() * span)
}

/// Monotonic unique id generator.
///
/// Ids embed a millisecond timestamp and a process-wide sequence number so
/// they sort chronologically and never collide, even when two ids are
/// minted within the same millisecond.
pub struct IdGen {
    // High 44 bits: millis. Low 20 bits: sequence. fetch_max keeps the
    // counter monotonic across clock stutter.
    state: AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// Mint a new id of the form `{prefix}_{millis}_{seq:04}`.
    pub fn next(&self, prefix: &str) -> String {
        let candidate = unix_millis() << 20;
        let prev = self.state.fetch_max(candidate, Ordering::SeqCst);
        let value = if prev >= candidate {
            // Same millisecond (or clock went backwards): bump the sequence.
            self.state.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            candidate
        };
        format!("{}_{}_{:04}", prefix, value >> 20, value & 0xFFFFF)
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}
