// Completion estimate for a run: resolved range widths plus queued single blocks.

use crate::config::PROGRESS_CAP;

use super::ranges::PreparedSpans;

/// Fraction complete, capped below 1 until the run is declared finished.
pub fn completion_fraction(downloaded: u64, expected: u64, finished: bool) -> f64 {
    if finished {
        1.0
    } else if expected == 0 {
        0.0
    } else {
        (downloaded as f64 / expected as f64).min(PROGRESS_CAP)
    }
}

/// Expected block total, built once after preparation. Only ever grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressEstimator {
    expected_blocks: u64,
}

impl ProgressEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every resolved range width and queued block of one log.
    pub fn add_prepared(&mut self, prepared: &PreparedSpans) {
        self.add_blocks(prepared.expected_blocks());
    }

    pub fn add_blocks(&mut self, count: u64) {
        self.expected_blocks = self.expected_blocks.saturating_add(count);
    }

    pub fn expected_blocks(&self) -> u64 {
        self.expected_blocks
    }

    /// `extra_expected` covers blocks a mirror expects on top of our own plan.
    pub fn fraction(&self, downloaded: u64, extra_expected: u64, finished: bool) -> f64 {
        completion_fraction(
            downloaded,
            self.expected_blocks.saturating_add(extra_expected),
            finished,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_estimate_is_zero_progress() {
        assert_eq!(completion_fraction(0, 0, false), 0.0);
        assert_eq!(completion_fraction(12, 0, false), 0.0);
    }

    #[test]
    fn test_progress_is_capped_until_finished() {
        assert_eq!(completion_fraction(5, 10, false), 0.5);
        assert_eq!(completion_fraction(10, 10, false), PROGRESS_CAP);
        assert_eq!(completion_fraction(14, 10, false), PROGRESS_CAP);
        assert_eq!(completion_fraction(0, 10, true), 1.0);
        assert_eq!(completion_fraction(0, 0, true), 1.0);
    }

    #[test]
    fn test_estimator_accumulates() {
        let mut estimator = ProgressEstimator::new();
        estimator.add_blocks(5);
        estimator.add_blocks(3);
        assert_eq!(estimator.expected_blocks(), 8);
        assert_eq!(estimator.fraction(2, 0, false), 0.25);
        assert_eq!(estimator.fraction(2, 8, false), 0.125);
    }
}
