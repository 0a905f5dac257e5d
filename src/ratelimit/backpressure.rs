//! Downstream throttle signals.
//!
//! Workers report when a downstream service pushed back. Reports decay
//! exponentially, and the decayed pressure scales down the concurrency a
//! worker should use for that bucket and class.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::limits::BucketKey;

/// Signals below this pressure are dropped when pruning.
const PRUNE_THRESHOLD: f64 = 0.01;
/// Prune faded signals once per this many reports.
const PRUNE_EVERY: u64 = 256;
/// Default bound on tracked bucket and class pairs.
const DEFAULT_MAX_SIGNALS: usize = 65_536;

#[derive(Debug, Clone, Copy)]
struct Signal {
    value: f64,
    updated_ms: u64,
}

impl Signal {
    fn decayed(&self, now_ms: u64, half_life_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.updated_ms) as f64;
        self.value * 0.5_f64.powf(elapsed / half_life_ms as f64)
    }
}

/// Concurrency hint returned to a worker after a throttle report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BackpressureHint {
    /// Decayed count of recent throttle reports
    pub pressure: f64,
    /// Suggested number of requests per second
    pub suggested_concurrency: u32,
}

/// Decaying throttle counters keyed by bucket and class.
#[derive(Debug)]
pub struct ThrottleSignals {
    half_life_ms: u64,
    max_signals: usize,
    reports: AtomicU64,
    signals: DashMap<(BucketKey, String), Signal>,
}

impl ThrottleSignals {
    pub fn new(half_life: Duration) -> Self {
        Self {
            half_life_ms: u64::try_from(half_life.as_millis()).unwrap_or(u64::MAX).max(1),
            max_signals: DEFAULT_MAX_SIGNALS,
            reports: AtomicU64::new(0),
            signals: DashMap::new(),
        }
    }

    pub fn with_max_signals(mut self, max_signals: usize) -> Self {
        self.max_signals = max_signals.max(1);
        self
    }

    /// Record one throttle report and return the resulting pressure.
    ///
    /// Faded signals are pruned periodically. Once `max_signals` pairs are
    /// tracked, a report for a new pair is counted but not stored.
    pub fn record(&self, bucket: &BucketKey, class: &str, now_ms: u64) -> f64 {
        let key = (bucket.clone(), class.to_string());
        let reports = self.reports.fetch_add(1, Ordering::Relaxed);
        let full = self.len() >= self.max_signals;
        if reports % PRUNE_EVERY == 0 || (full && !self.signals.contains_key(&key)) {
            let pruned = self.prune(now_ms, PRUNE_THRESHOLD);
            if pruned > 0 {
                debug!(pruned = pruned, remaining = self.len(), "Pruned faded throttle signals");
            }
            if self.len() >= self.max_signals && !self.signals.contains_key(&key) {
                debug!(bucket = %bucket, class = %class, "Throttle signal table full, report not tracked");
                return 1.0;
            }
        }

        let mut entry = self
            .signals
            .entry(key)
            .or_insert(Signal {
                value: 0.0,
                updated_ms: now_ms,
            });
        let value = entry.decayed(now_ms, self.half_life_ms) + 1.0;
        let updated_ms = now_ms.max(entry.updated_ms);
        *entry = Signal { value, updated_ms };
        debug!(bucket = %bucket, class = %class, pressure = value, "Recorded downstream throttle");
        value
    }

    /// Current pressure for a bucket and class; zero if never reported.
    pub fn pressure(&self, bucket: &BucketKey, class: &str, now_ms: u64) -> f64 {
        self.signals
            .get(&(bucket.clone(), class.to_string()))
            .map(|signal| signal.decayed(now_ms, self.half_life_ms))
            .unwrap_or(0.0)
    }

    /// Drop signals that have decayed below `threshold`.
    pub fn prune(&self, now_ms: u64, threshold: f64) -> usize {
        let before = self.signals.len();
        self.signals
            .retain(|_, signal| signal.decayed(now_ms, self.half_life_ms) >= threshold);
        before.saturating_sub(self.signals.len())
    }

    /// Number of tracked bucket and class pairs.
    pub fn len(&self) -> usize {
        self.signals.len()
    }
}

/// Scale a per-second base rate down by pressure, never below one.
pub fn suggested_concurrency(base_per_second: f64, pressure: f64) -> u32 {
    let scaled = (base_per_second / (1.0 + pressure.max(0.0))).floor();
    if scaled.is_finite() && scaled >= 1.0 {
        scaled.min(u32::MAX as f64) as u32
    } else {
        1
    }
}
