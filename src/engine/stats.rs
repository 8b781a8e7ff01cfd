// Live transfer accounting: folds per-block events into cumulative counters and snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use super::progress::ProgressEstimator;
use super::speed::SpeedTracker;
use crate::source::traits::{MirrorMonitor, MonitorStats, TransferListener, TransferTotals};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DownloadStats {
    pub bytes: u64,
    pub blocks: u64,
    pub speed: f64,
    pub progress: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UploadStats {
    pub bytes: u64,
    pub blocks: u64,
    pub speed: f64,
}

/// Point-in-time progress report published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stats {
    pub peers: usize,
    pub download: DownloadStats,
    pub upload: UploadStats,
}

/// Where throughput figures come from for one run. Chosen once, never mixed.
pub enum ThroughputSource {
    Local {
        download: Mutex<SpeedTracker>,
        upload: Mutex<SpeedTracker>,
    },
    /// A mirror is running; its monitor owns the meters and contributes totals.
    Delegated(Arc<dyn MirrorMonitor>),
}

impl ThroughputSource {
    pub fn local(window: Duration) -> Self {
        Self::Local {
            download: Mutex::new(SpeedTracker::new(window)),
            upload: Mutex::new(SpeedTracker::new(window)),
        }
    }

    pub fn delegated(monitor: Arc<dyn MirrorMonitor>) -> Self {
        Self::Delegated(monitor)
    }

    fn record_download(&self, byte_length: u64) {
        match self {
            Self::Local { download, .. } => download.lock().record(byte_length),
            Self::Delegated(monitor) => monitor.record_download(byte_length),
        }
    }

    fn record_upload(&self, byte_length: u64) {
        match self {
            Self::Local { upload, .. } => upload.lock().record(byte_length),
            Self::Delegated(monitor) => monitor.record_upload(byte_length),
        }
    }

    fn download_speed(&self) -> f64 {
        match self {
            Self::Local { download, .. } => download.lock().speed(),
            Self::Delegated(monitor) => monitor.download_speed(),
        }
    }

    fn upload_speed(&self) -> f64 {
        match self {
            Self::Local { upload, .. } => upload.lock().speed(),
            Self::Delegated(monitor) => monitor.upload_speed(),
        }
    }

    /// Totals the delegate has accounted for itself. Zero when local.
    fn delegate_stats(&self) -> MonitorStats {
        match self {
            Self::Local { .. } => MonitorStats::default(),
            Self::Delegated(monitor) => monitor.stats(),
        }
    }

    fn delegate_peers(&self) -> usize {
        match self {
            Self::Local { .. } => 0,
            Self::Delegated(monitor) => monitor.peer_count(),
        }
    }

    fn delegate_estimate(&self) -> u64 {
        match self {
            Self::Local { .. } => 0,
            Self::Delegated(monitor) => monitor.downloaded_blocks_estimate(),
        }
    }
}

#[derive(Default)]
struct Counters {
    downloaded_blocks: AtomicU64,
    downloaded_bytes: AtomicU64,
    uploaded_blocks: AtomicU64,
    uploaded_bytes: AtomicU64,
}

impl Counters {
    fn download(&self) -> TransferTotals {
        TransferTotals {
            bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            blocks: self.downloaded_blocks.load(Ordering::Relaxed),
        }
    }

    fn upload(&self) -> TransferTotals {
        TransferTotals {
            bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            blocks: self.uploaded_blocks.load(Ordering::Relaxed),
        }
    }
}

/// Registered as a listener on every active log of the drive.
pub struct TransferAggregator {
    counters: Counters,
    throughput: ThroughputSource,
}

impl TransferAggregator {
    pub fn new(throughput: ThroughputSource) -> Self {
        Self {
            counters: Counters::default(),
            throughput,
        }
    }

    /// Our own downloads, excluding anything the delegate reports.
    pub fn downloaded(&self) -> TransferTotals {
        self.counters.download()
    }

    pub fn snapshot(
        &self,
        primary_peers: usize,
        estimator: &ProgressEstimator,
        finished: bool,
    ) -> Stats {
        let delegate = self.throughput.delegate_stats();
        let down = self.counters.download();
        let up = self.counters.upload();

        let blocks = down.blocks + delegate.download.blocks;
        let progress =
            estimator.fraction(blocks, self.throughput.delegate_estimate(), finished);

        Stats {
            peers: self.throughput.delegate_peers().max(primary_peers),
            download: DownloadStats {
                bytes: down.bytes + delegate.download.bytes,
                blocks,
                speed: self.throughput.download_speed(),
                progress,
            },
            upload: UploadStats {
                bytes: up.bytes + delegate.upload.bytes,
                blocks: up.blocks + delegate.upload.blocks,
                speed: self.throughput.upload_speed(),
            },
        }
    }
}

impl TransferListener for TransferAggregator {
    fn on_download(&self, _index: u64, byte_length: u64) {
        self.counters.downloaded_blocks.fetch_add(1, Ordering::Relaxed);
        self.counters
            .downloaded_bytes
            .fetch_add(byte_length, Ordering::Relaxed);
        self.throughput.record_download(byte_length);
    }

    fn on_upload(&self, _index: u64, byte_length: u64) {
        self.counters.uploaded_blocks.fetch_add(1, Ordering::Relaxed);
        self.counters
            .uploaded_bytes
            .fetch_add(byte_length, Ordering::Relaxed);
        self.throughput.record_upload(byte_length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct FixedMonitor {
        recorded: AtomicU64,
    }

    #[async_trait]
    impl MirrorMonitor for FixedMonitor {
        async fn preloaded(&self) {}

        fn stats(&self) -> MonitorStats {
            MonitorStats {
                upload: TransferTotals { bytes: 10, blocks: 1 },
                download: TransferTotals {
                    bytes: 4096,
                    blocks: 4,
                },
            }
        }

        fn download_speed(&self) -> f64 {
            123.0
        }

        fn upload_speed(&self) -> f64 {
            7.0
        }

        fn record_download(&self, byte_length: u64) {
            self.recorded.fetch_add(byte_length, Ordering::Relaxed);
        }

        fn record_upload(&self, _byte_length: u64) {}

        fn peer_count(&self) -> usize {
            5
        }

        fn downloaded_blocks_estimate(&self) -> u64 {
            6
        }

        fn destroy(&self) {}
    }

    #[test]
    fn test_local_accounting() {
        let aggregator = TransferAggregator::new(ThroughputSource::local(Duration::from_secs(5)));
        aggregator.on_download(0, 100);
        aggregator.on_download(1, 50);
        aggregator.on_upload(0, 100);

        let mut estimator = ProgressEstimator::new();
        estimator.add_blocks(4);

        let stats = aggregator.snapshot(2, &estimator, false);
        assert_eq!(stats.peers, 2);
        assert_eq!(stats.download.blocks, 2);
        assert_eq!(stats.download.bytes, 150);
        assert_eq!(stats.download.progress, 0.5);
        assert!(stats.download.speed > 0.0);
        assert_eq!(stats.upload.blocks, 1);
        assert_eq!(stats.upload.bytes, 100);

        let done = aggregator.snapshot(2, &estimator, true);
        assert_eq!(done.download.progress, 1.0);
    }

    #[test]
    fn test_delegated_accounting_folds_totals() {
        let monitor = Arc::new(FixedMonitor::default());
        let aggregator =
            TransferAggregator::new(ThroughputSource::delegated(monitor.clone()));
        aggregator.on_download(9, 1000);

        let mut estimator = ProgressEstimator::new();
        estimator.add_blocks(4);

        let stats = aggregator.snapshot(1, &estimator, false);
        assert_eq!(stats.peers, 5);
        assert_eq!(stats.download.blocks, 5);
        assert_eq!(stats.download.bytes, 5096);
        assert_eq!(stats.download.speed, 123.0);
        assert_eq!(stats.download.progress, 0.5);
        assert_eq!(stats.upload.bytes, 10);
        assert_eq!(stats.upload.speed, 7.0);
        assert_eq!(monitor.recorded.load(Ordering::Relaxed), 1000);
        assert_eq!(aggregator.downloaded().blocks, 1);
    }
}
