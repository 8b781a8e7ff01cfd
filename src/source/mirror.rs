// In-process mirror delegate: copies a fixed file list and keeps its own accounting.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, OnceCell};
use tracing::{debug, info};

use super::traits::{DiffOp, MirrorDelegate, MirrorDiff, MirrorMonitor, MonitorStats};
use crate::engine::speed::SpeedTracker;

const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

fn estimate_blocks(files: &[(String, u64)], block_size: u64) -> u64 {
    files
        .iter()
        .map(|(_, size)| size.div_ceil(block_size).max(1))
        .sum()
}

/// Accounting shared between the mirror and the monitors it hands out.
pub struct MemoryMonitor {
    preloaded: watch::Sender<bool>,
    preload_started: AtomicBool,
    peers: AtomicUsize,
    estimate: AtomicU64,
    stats: Mutex<MonitorStats>,
    download: Mutex<SpeedTracker>,
    upload: Mutex<SpeedTracker>,
    foreign_samples: AtomicU64,
    destroyed: AtomicBool,
}

impl MemoryMonitor {
    fn begin_preload(self: &Arc<Self>, delay: Duration) {
        if self.preload_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            monitor.preloaded.send_replace(true);
            debug!("mirror monitor preloaded");
        });
    }

    fn record_copied(&self, byte_length: u64) {
        {
            let mut stats = self.stats.lock();
            stats.download.blocks += 1;
            stats.download.bytes += byte_length;
        }
        self.download.lock().record(byte_length);
    }

    /// Bytes recorded through [`MirrorMonitor::record_download`] by others.
    pub fn foreign_samples(&self) -> u64 {
        self.foreign_samples.load(Ordering::Relaxed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MirrorMonitor for MemoryMonitor {
    async fn preloaded(&self) {
        let mut rx = self.preloaded.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn stats(&self) -> MonitorStats {
        *self.stats.lock()
    }

    fn download_speed(&self) -> f64 {
        self.download.lock().speed()
    }

    fn upload_speed(&self) -> f64 {
        self.upload.lock().speed()
    }

    fn record_download(&self, byte_length: u64) {
        self.foreign_samples.fetch_add(byte_length, Ordering::Relaxed);
        self.download.lock().record(byte_length);
    }

    fn record_upload(&self, byte_length: u64) {
        self.upload.lock().record(byte_length);
    }

    fn peer_count(&self) -> usize {
        self.peers.load(Ordering::Relaxed)
    }

    fn downloaded_blocks_estimate(&self) -> u64 {
        self.estimate.load(Ordering::Relaxed)
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
    }
}

/// Mirrors `files` (key, size in bytes) block by block when awaited.
pub struct MemoryMirror {
    files: Vec<(String, u64)>,
    block_size: u64,
    latency: Duration,
    preload_delay: Duration,
    failure: Option<String>,
    monitor: Arc<MemoryMonitor>,
    diffs_tx: mpsc::Sender<MirrorDiff>,
    diffs_rx: Mutex<Option<mpsc::Receiver<MirrorDiff>>>,
    outcome: OnceCell<std::result::Result<(), String>>,
}

impl MemoryMirror {
    pub fn new(files: Vec<(String, u64)>) -> Self {
        Self::build(files, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.max(1);
        self.monitor
            .estimate
            .store(estimate_blocks(&self.files, self.block_size), Ordering::Relaxed);
        self
    }

    pub fn with_preload_delay(mut self, delay: Duration) -> Self {
        self.preload_delay = delay;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_peers(self, peers: usize) -> Self {
        self.set_peers(peers);
        self
    }

    /// Fail after the first file has been copied.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    fn build(files: Vec<(String, u64)>, block_size: u64) -> Self {
        let estimate = estimate_blocks(&files, block_size);
        let window = Duration::from_secs(5);
        let (diffs_tx, diffs_rx) = mpsc::channel(files.len().max(1));
        let (preloaded, _) = watch::channel(false);

        Self {
            files,
            block_size,
            latency: Duration::ZERO,
            preload_delay: Duration::ZERO,
            failure: None,
            monitor: Arc::new(MemoryMonitor {
                preloaded,
                preload_started: AtomicBool::new(false),
                peers: AtomicUsize::new(1),
                estimate: AtomicU64::new(estimate),
                stats: Mutex::new(MonitorStats::default()),
                download: Mutex::new(SpeedTracker::new(window)),
                upload: Mutex::new(SpeedTracker::new(window)),
                foreign_samples: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
            }),
            diffs_tx,
            diffs_rx: Mutex::new(Some(diffs_rx)),
            outcome: OnceCell::new(),
        }
    }

    pub fn set_peers(&self, peers: usize) {
        self.monitor.peers.store(peers, Ordering::Relaxed);
    }

    /// The shared monitor, for inspection.
    pub fn memory_monitor(&self) -> Arc<MemoryMonitor> {
        Arc::clone(&self.monitor)
    }

    async fn copy(&self) -> std::result::Result<(), String> {
        for (copied, (key, size)) in self.files.iter().enumerate() {
            if copied > 0 {
                if let Some(message) = &self.failure {
                    return Err(message.clone());
                }
            }

            let blocks = size.div_ceil(self.block_size).max(1);
            for block in 0..blocks {
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }
                let offset = block * self.block_size;
                let len = self.block_size.min(size.saturating_sub(offset));
                self.monitor.record_copied(len);
            }

            let diff = MirrorDiff {
                op: DiffOp::Add,
                key: key.clone(),
            };
            // Nobody listening is fine; the copy itself still counts.
            let _ = self.diffs_tx.try_send(diff);
        }

        if let Some(message) = &self.failure {
            return Err(message.clone());
        }
        info!("mirror copied {} files", self.files.len());
        Ok(())
    }
}

#[async_trait]
impl MirrorDelegate for MemoryMirror {
    fn monitor(&self) -> Arc<dyn MirrorMonitor> {
        self.monitor.begin_preload(self.preload_delay);
        Arc::clone(&self.monitor) as Arc<dyn MirrorMonitor>
    }

    async fn done(&self) -> Result<()> {
        self.outcome
            .get_or_init(|| self.copy())
            .await
            .clone()
            .map_err(|message| anyhow!(message))
    }

    fn take_diffs(&self) -> Option<mpsc::Receiver<MirrorDiff>> {
        self.diffs_rx.lock().take()
    }
}
