use std::time::Duration;

use serde::Deserialize;

/// Metadata key under which the encoded warmup plan is stored.
pub const WARMUP_KEY: &str = "warmup";

/// Upper bound for reported progress until a run is declared finished.
pub const PROGRESS_CAP: f64 = 0.99;

/// Top-level configuration for a prefetch run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Interval between published stats snapshots, in milliseconds.
    pub interval_ms: u64,
    /// Decay constant of the throughput estimators, in milliseconds.
    pub speed_window_ms: u64,
    /// Capacity of each subscriber's event channel.
    pub event_buffer: usize,
}

impl PrefetchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_millis(self.speed_window_ms.max(1))
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            interval_ms: 250,
            speed_window_ms: 5_000,
            event_buffer: 64,
        }
    }
}
