// Exponentially-decaying throughput estimator.

use std::time::{Duration, Instant};

/// Tracks bytes per second where each sample's weight decays as `exp(-age / window)`.
///
/// The decayed byte total divided by `window` is the rate, so a steady stream of
/// `r` bytes per second converges to `r`.
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    window: f64,
    level: f64,
    last: Option<Instant>,
}

impl SpeedTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.as_secs_f64().max(f64::EPSILON),
            level: 0.0,
            last: None,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(bytes, Instant::now());
    }

    pub fn record_at(&mut self, bytes: u64, now: Instant) {
        self.level = self.decayed_level(now) + bytes as f64;
        self.last = Some(now);
    }

    /// Current rate in bytes per second.
    pub fn speed(&self) -> f64 {
        self.speed_at(Instant::now())
    }

    pub fn speed_at(&self, now: Instant) -> f64 {
        self.decayed_level(now) / self.window
    }

    fn decayed_level(&self, now: Instant) -> f64 {
        match self.last {
            Some(last) => {
                let age = now.saturating_duration_since(last).as_secs_f64();
                self.level * (-age / self.window).exp()
            }
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_tracker_reports_zero() {
        let tracker = SpeedTracker::new(Duration::from_secs(5));
        assert_eq!(tracker.speed(), 0.0);
    }

    #[test]
    fn test_burst_decays() {
        let t0 = Instant::now();
        let mut tracker = SpeedTracker::new(Duration::from_secs(5));
        tracker.record_at(5_000, t0);

        assert!((tracker.speed_at(t0) - 1_000.0).abs() < 1e-6);
        let later = tracker.speed_at(t0 + Duration::from_secs(5));
        assert!((later - 1_000.0 / std::f64::consts::E).abs() < 1e-6);
        assert!(tracker.speed_at(t0 + Duration::from_secs(120)) < 1.0);
    }

    #[test]
    fn test_steady_stream_converges() {
        let t0 = Instant::now();
        let mut tracker = SpeedTracker::new(Duration::from_secs(5));
        // 100 bytes every 10 ms = 10 kB/s for one minute.
        let mut now = t0;
        for _ in 0..6_000 {
            now += Duration::from_millis(10);
            tracker.record_at(100, now);
        }
        let speed = tracker.speed_at(now);
        assert!((speed - 10_000.0).abs() / 10_000.0 < 0.01, "speed={speed}");
    }
}
