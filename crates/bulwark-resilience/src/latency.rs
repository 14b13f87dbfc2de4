//! Per-key latency averages
//!
//! Each observed attempt updates an exponential moving average for its
//! resource key. The first sample seeds the average.

use dashmap::DashMap;
use std::time::Duration;

/// Weight of a new sample
const ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
struct Window {
    avg_ms: f64,
    samples: u64,
}

/// Moving-average latency per resource key
#[derive(Debug, Default)]
pub struct LatencyTracker {
    windows: DashMap<String, Window>,
}

impl LatencyTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed response time for `key`
    pub fn record(&self, key: &str, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.windows
            .entry(key.to_string())
            .and_modify(|w| {
                w.avg_ms = (1.0 - ALPHA) * w.avg_ms + ALPHA * sample;
                w.samples += 1;
            })
            .or_insert(Window {
                avg_ms: sample,
                samples: 1,
            });
    }

    /// Average latency for `key`
    pub fn average(&self, key: &str) -> Option<Duration> {
        self.windows
            .get(key)
            .map(|w| Duration::from_secs_f64(w.avg_ms.max(0.0) / 1000.0))
    }

    /// Number of samples recorded for `key`
    pub fn samples(&self, key: &str) -> u64 {
        self.windows.get(key).map(|w| w.samples).unwrap_or(0)
    }

    /// Keys whose average exceeds `threshold`, slowest first
    pub fn slow_keys(&self, threshold: Duration) -> Vec<(String, Duration)> {
        let limit = threshold.as_secs_f64() * 1000.0;
        let mut slow: Vec<(String, Duration)> = self
            .windows
            .iter()
            .filter(|w| w.avg_ms > limit)
            .map(|w| {
                (
                    w.key().clone(),
                    Duration::from_secs_f64(w.avg_ms / 1000.0),
                )
            })
            .collect();
        slow.sort_by(|a, b| b.1.cmp(&a.1));
        slow
    }

    /// Forget the history of `key`
    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }
}
