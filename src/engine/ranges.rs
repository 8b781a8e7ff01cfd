// Range preparation: split warmup spans into single missing blocks and range jobs.

use std::ops::Deref;

use anyhow::Result;
use tracing::debug;

use crate::plan::Span;
use crate::source::traits::{BlockLog, DownloadJob, RangeJob};

/// Owns a download job and cancels it when dropped.
///
/// Cancelling a finished job is a no-op, so this only has an effect when a
/// run is torn down early.
pub struct JobGuard<J: ?Sized + DownloadJob>(Box<J>);

impl<J: ?Sized + DownloadJob> JobGuard<J> {
    pub fn new(job: Box<J>) -> Self {
        Self(job)
    }
}

impl<J: ?Sized + DownloadJob> Deref for JobGuard<J> {
    type Target = J;

    fn deref(&self) -> &J {
        &self.0
    }
}

impl<J: ?Sized + DownloadJob> Drop for JobGuard<J> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// A range job whose width has been resolved.
pub struct PendingRange {
    job: JobGuard<dyn RangeJob>,
    width: Option<u64>,
}

impl PendingRange {
    /// Blocks the job had to request. `None` when the range was already local.
    pub fn width(&self) -> Option<u64> {
        self.width
    }

    pub async fn done(&self) -> Result<()> {
        self.job.done().await
    }
}

/// Outcome of preparing one log's spans.
#[derive(Default)]
pub struct PreparedSpans {
    /// Missing single blocks, to be fetched as one block-set download.
    pub blocks: Vec<u64>,
    pub ranges: Vec<PendingRange>,
}

impl PreparedSpans {
    pub fn expected_blocks(&self) -> u64 {
        let ranged: u64 = self.ranges.iter().filter_map(PendingRange::width).sum();
        ranged + self.blocks.len() as u64
    }
}

/// Classify `spans` against `log`.
///
/// Width-1 spans are presence-checked and queued only if missing. Wider spans
/// are issued as range jobs immediately; each one must report ready before the
/// next span is looked at. Failures propagate untouched and any range already
/// issued is cancelled as the partial result is dropped.
pub async fn prepare_ranges(spans: &[Span], log: &dyn BlockLog) -> Result<PreparedSpans> {
    let mut prepared = PreparedSpans::default();

    for span in spans {
        if span.is_single() {
            if !log.has_block(span.start()).await? {
                prepared.blocks.push(span.start());
            }
            continue;
        }

        let job = JobGuard::new(log.download_range(span.start(), span.end()));
        let width = job.ready().await?;
        prepared.ranges.push(PendingRange { job, width });
    }

    debug!(
        "prepared {} spans: {} single blocks, {} ranges",
        spans.len(),
        prepared.blocks.len(),
        prepared.ranges.len()
    );
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::{pattern_blocks, MemoryLog};

    fn spans(list: &[(u64, u64)]) -> Vec<Span> {
        list.iter()
            .map(|&(s, e)| Span::new(s, e).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_singles_and_ranges_are_separated() {
        let log = MemoryLog::new("meta", pattern_blocks(32, 16));
        log.mark_local(0, 1);

        let prepared = prepare_ranges(&spans(&[(0, 1), (1, 2), (4, 9), (20, 21)]), &log)
            .await
            .unwrap();

        assert_eq!(prepared.blocks, vec![1, 20]);
        assert_eq!(prepared.ranges.len(), 1);
        assert_eq!(prepared.ranges[0].width(), Some(5));
        assert_eq!(prepared.expected_blocks(), 7);
        assert_eq!(log.range_download_calls(), 1);

        for range in &prepared.ranges {
            range.done().await.unwrap();
        }
        assert!(log.has_local(8));
    }

    #[tokio::test]
    async fn test_local_range_contributes_nothing() {
        let log = MemoryLog::seeded("meta", pattern_blocks(8, 16));
        let prepared = prepare_ranges(&spans(&[(0, 4), (5, 6)]), &log).await.unwrap();

        assert!(prepared.blocks.is_empty());
        assert_eq!(prepared.ranges[0].width(), None);
        assert_eq!(prepared.expected_blocks(), 0);
    }

    #[tokio::test]
    async fn test_range_failure_propagates() {
        let log = MemoryLog::new("meta", pattern_blocks(4, 16));
        let result = prepare_ranges(&spans(&[(0, 2), (5, 9)]), &log).await;
        assert!(result.is_err());
    }
}
