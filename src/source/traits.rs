use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::plan::WarmupPayload;

/// Handle returned by a log when a listener is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Receives per-block transfer notifications from a log.
///
/// Called synchronously from the log's notification path, so implementations
/// must not block.
pub trait TransferListener: Send + Sync {
    fn on_download(&self, index: u64, byte_length: u64);
    fn on_upload(&self, index: u64, byte_length: u64);
}

/// An in-flight download owned by the storage engine.
#[async_trait]
pub trait DownloadJob: Send + Sync {
    /// Resolves once every requested block is stored locally.
    async fn done(&self) -> Result<()>;
    /// Best-effort cancellation. A finished job ignores it.
    fn cancel(&self);
}

/// A contiguous multi-block download.
#[async_trait]
pub trait RangeJob: DownloadJob {
    /// Resolves once the exact number of blocks to fetch is known.
    /// `None` means nothing had to be requested.
    async fn ready(&self) -> Result<Option<u64>>;
}

/// One append-only, block-addressed, replicated log.
#[async_trait]
pub trait BlockLog: Send + Sync {
    async fn has_block(&self, index: u64) -> Result<bool>;
    fn download_blocks(&self, blocks: Vec<u64>) -> Box<dyn DownloadJob>;
    fn download_range(&self, start: u64, end: u64) -> Box<dyn RangeJob>;
    fn add_listener(&self, listener: Arc<dyn TransferListener>) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
    fn peer_count(&self) -> usize;
}

/// A drive: one metadata log, an optional blob log and a key/value view.
#[async_trait]
pub trait Drive: Send + Sync {
    fn metadata_log(&self) -> Arc<dyn BlockLog>;
    async fn blob_log(&self) -> Result<Option<Arc<dyn BlockLog>>>;
    async fn metadata_value(&self, key: &str) -> Result<Option<WarmupPayload>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub bytes: u64,
    pub blocks: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub upload: TransferTotals,
    pub download: TransferTotals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
    Add,
    Change,
    Remove,
}

/// One mirrored-file change, passed through to subscribers untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorDiff {
    pub op: DiffOp,
    pub key: String,
}

/// Live accounting view of a running mirror.
#[async_trait]
pub trait MirrorMonitor: Send + Sync {
    /// Resolves once the monitor has finished its initial preload.
    async fn preloaded(&self);
    fn stats(&self) -> MonitorStats;
    fn download_speed(&self) -> f64;
    fn upload_speed(&self) -> f64;
    /// Feed a download sample into the mirror's own meter.
    fn record_download(&self, byte_length: u64);
    /// Feed an upload sample into the mirror's own meter.
    fn record_upload(&self, byte_length: u64);
    fn peer_count(&self) -> usize;
    fn downloaded_blocks_estimate(&self) -> u64;
    fn destroy(&self);
}

/// A full-tree mirror running alongside the prefetch.
#[async_trait]
pub trait MirrorDelegate: Send + Sync {
    fn monitor(&self) -> Arc<dyn MirrorMonitor>;
    async fn done(&self) -> Result<()>;
    /// Change records, if the mirror produces them. Yields the receiver once.
    fn take_diffs(&self) -> Option<mpsc::Receiver<MirrorDiff>> {
        None
    }
}
