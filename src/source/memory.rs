// In-process log replica: copies blocks from a remote image into a local bitmap.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bitvec::prelude::*;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::traits::{BlockLog, DownloadJob, Drive, ListenerId, RangeJob, TransferListener};
use crate::plan::{WarmupPayload, WarmupPlan};

type Listeners = Vec<(ListenerId, Arc<dyn TransferListener>)>;

/// Build `count` blocks of `block_size` bytes with a recognisable pattern.
pub fn pattern_blocks(count: usize, block_size: usize) -> Vec<Bytes> {
    (0..count)
        .map(|i| Bytes::from(vec![(i % 251) as u8; block_size]))
        .collect()
}

struct LogInner {
    name: String,
    remote: Vec<Bytes>,
    local: RwLock<BitVec>,
    peers: AtomicUsize,
    latency: Mutex<Duration>,
    failing: Mutex<HashSet<u64>>,
    listeners: RwLock<Listeners>,
    next_listener: AtomicU64,
    block_downloads: AtomicUsize,
    range_downloads: AtomicUsize,
}

impl LogInner {
    fn has(&self, index: u64) -> bool {
        let local = self.local.read();
        usize::try_from(index)
            .ok()
            .and_then(|i| local.get(i).map(|bit| *bit))
            .unwrap_or(false)
    }

    fn listeners(&self) -> Listeners {
        self.listeners.read().clone()
    }

    /// Fetch one block from the remote image. Returns `false` if it was already local.
    async fn fetch_one(&self, index: u64) -> Result<bool> {
        if self.has(index) {
            return Ok(false);
        }
        let data = usize::try_from(index)
            .ok()
            .and_then(|i| self.remote.get(i))
            .ok_or_else(|| {
                anyhow!(
                    "{}: block {} beyond log length {}",
                    self.name,
                    index,
                    self.remote.len()
                )
            })?;
        if self.peers.load(Ordering::Relaxed) == 0 {
            bail!("{}: no peer has block {}", self.name, index);
        }

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.lock().contains(&index) {
            bail!("{}: peer disconnected while fetching block {}", self.name, index);
        }

        {
            let mut local = self.local.write();
            let i = index as usize;
            if local[i] {
                return Ok(false);
            }
            local.set(i, true);
        }

        let byte_length = data.len() as u64;
        for (_, listener) in self.listeners() {
            listener.on_download(index, byte_length);
        }
        Ok(true)
    }

    async fn fetch_all(&self, indices: &[u64]) -> Result<()> {
        let mut fetched = 0usize;
        for &index in indices {
            if self.fetch_one(index).await? {
                fetched += 1;
            }
        }
        debug!(
            "{}: job stored {} of {} requested blocks",
            self.name,
            fetched,
            indices.len()
        );
        Ok(())
    }
}

type JobState = Option<std::result::Result<(), String>>;

struct MemoryJob {
    state: watch::Receiver<JobState>,
    token: CancellationToken,
}

impl MemoryJob {
    fn spawn(inner: Arc<LogInner>, indices: Vec<u64>) -> Self {
        let (tx, rx) = watch::channel(None);
        let token = CancellationToken::new();
        let task_token = token.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                r = inner.fetch_all(&indices) => r,
                _ = task_token.cancelled() => Err(anyhow!("{}: download cancelled", inner.name)),
            };
            let outcome = result.map_err(|e| {
                warn!("{}", e);
                format!("{e:#}")
            });
            let _ = tx.send(Some(outcome));
        });

        Self { state: rx, token }
    }
}

#[async_trait]
impl DownloadJob for MemoryJob {
    async fn done(&self) -> Result<()> {
        let mut state = self.state.clone();
        let changed = state.wait_for(Option::is_some).await;
        let outcome = match changed {
            Ok(current) => (*current).clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => Err(anyhow!("download task dropped")),
        }
    }

    fn cancel(&self) {
        self.token.cancel();
    }
}

struct MemoryRangeJob {
    resolved: std::result::Result<Option<u64>, String>,
    job: Option<MemoryJob>,
}

#[async_trait]
impl DownloadJob for MemoryRangeJob {
    async fn done(&self) -> Result<()> {
        match (&self.resolved, &self.job) {
            (Err(msg), _) => Err(anyhow!(msg.clone())),
            (Ok(_), Some(job)) => job.done().await,
            (Ok(_), None) => Ok(()),
        }
    }

    fn cancel(&self) {
        if let Some(job) = &self.job {
            job.cancel();
        }
    }
}

#[async_trait]
impl RangeJob for MemoryRangeJob {
    async fn ready(&self) -> Result<Option<u64>> {
        self.resolved.clone().map_err(|msg| anyhow!(msg))
    }
}

/// A log replica whose "peer" holds a full copy of every block.
///
/// Cloning shares the replica.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

impl MemoryLog {
    /// A replica with nothing stored locally and one connected peer.
    pub fn new(name: impl Into<String>, blocks: Vec<Bytes>) -> Self {
        let len = blocks.len();
        Self {
            inner: Arc::new(LogInner {
                name: name.into(),
                remote: blocks,
                local: RwLock::new(bitvec![0; len]),
                peers: AtomicUsize::new(1),
                latency: Mutex::new(Duration::ZERO),
                failing: Mutex::new(HashSet::new()),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                block_downloads: AtomicUsize::new(0),
                range_downloads: AtomicUsize::new(0),
            }),
        }
    }

    /// A replica that already holds every block.
    pub fn seeded(name: impl Into<String>, blocks: Vec<Bytes>) -> Self {
        let log = Self::new(name, blocks);
        log.mark_local(0, log.len());
        log
    }

    pub fn with_peers(self, peers: usize) -> Self {
        self.set_peers(peers);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock() = latency;
        self
    }

    pub fn set_peers(&self, peers: usize) {
        self.inner.peers.store(peers, Ordering::Relaxed);
    }

    /// Mark `[start, end)` as already stored, without firing listeners.
    pub fn mark_local(&self, start: u64, end: u64) {
        let mut local = self.inner.local.write();
        let end = (end as usize).min(local.len());
        for i in (start as usize)..end {
            local.set(i, true);
        }
    }

    /// Make every future fetch of `index` fail as if the peer dropped.
    pub fn fail_block(&self, index: u64) {
        self.inner.failing.lock().insert(index);
    }

    pub fn len(&self) -> u64 {
        self.inner.remote.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.inner.remote.is_empty()
    }

    pub fn has_local(&self, index: u64) -> bool {
        self.inner.has(index)
    }

    pub fn local_count(&self) -> u64 {
        self.inner.local.read().count_ones() as u64
    }

    /// Simulate a peer reading a locally held block from us.
    pub fn serve(&self, index: u64) -> Result<()> {
        if !self.inner.has(index) {
            bail!("{}: block {} not held locally", self.inner.name, index);
        }
        let byte_length = self.inner.remote[index as usize].len() as u64;
        for (_, listener) in self.inner.listeners() {
            listener.on_upload(index, byte_length);
        }
        Ok(())
    }

    pub fn block_download_calls(&self) -> usize {
        self.inner.block_downloads.load(Ordering::Relaxed)
    }

    pub fn range_download_calls(&self) -> usize {
        self.inner.range_downloads.load(Ordering::Relaxed)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }
}

#[async_trait]
impl BlockLog for MemoryLog {
    async fn has_block(&self, index: u64) -> Result<bool> {
        Ok(self.inner.has(index))
    }

    fn download_blocks(&self, blocks: Vec<u64>) -> Box<dyn DownloadJob> {
        self.inner.block_downloads.fetch_add(1, Ordering::Relaxed);
        debug!("{}: block-set download of {} blocks", self.inner.name, blocks.len());
        Box::new(MemoryJob::spawn(Arc::clone(&self.inner), blocks))
    }

    fn download_range(&self, start: u64, end: u64) -> Box<dyn RangeJob> {
        self.inner.range_downloads.fetch_add(1, Ordering::Relaxed);

        if end <= start || start >= self.len() {
            return Box::new(MemoryRangeJob {
                resolved: Err(format!(
                    "{}: range [{}, {}) outside log of length {}",
                    self.inner.name,
                    start,
                    end,
                    self.len()
                )),
                job: None,
            });
        }

        let end = end.min(self.len());
        let missing: Vec<u64> = (start..end).filter(|&i| !self.inner.has(i)).collect();
        if missing.is_empty() {
            return Box::new(MemoryRangeJob {
                resolved: Ok(None),
                job: None,
            });
        }

        debug!(
            "{}: range download [{}, {}) with {} missing",
            self.inner.name,
            start,
            end,
            missing.len()
        );
        Box::new(MemoryRangeJob {
            resolved: Ok(Some(end - start)),
            job: Some(MemoryJob::spawn(Arc::clone(&self.inner), missing)),
        })
    }

    fn add_listener(&self, listener: Arc<dyn TransferListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.inner.listeners.write().retain(|(existing, _)| *existing != id);
    }

    fn peer_count(&self) -> usize {
        self.inner.peers.load(Ordering::Relaxed)
    }
}

/// Drive backed by [`MemoryLog`]s and an in-memory metadata table.
pub struct MemoryDrive {
    metadata: MemoryLog,
    blobs: Option<MemoryLog>,
    values: RwLock<HashMap<String, WarmupPayload>>,
}

impl MemoryDrive {
    pub fn new(metadata: MemoryLog, blobs: Option<MemoryLog>) -> Self {
        Self {
            metadata,
            blobs,
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn put_value(&self, key: &str, payload: WarmupPayload) {
        self.values.write().insert(key.to_string(), payload);
    }

    /// Store `plan` under the warmup key.
    pub fn put_plan(&self, plan: &WarmupPlan) {
        self.put_value(crate::config::WARMUP_KEY, plan.encode());
    }

    pub fn metadata(&self) -> &MemoryLog {
        &self.metadata
    }

    pub fn blobs(&self) -> Option<&MemoryLog> {
        self.blobs.as_ref()
    }
}

#[async_trait]
impl Drive for MemoryDrive {
    fn metadata_log(&self) -> Arc<dyn BlockLog> {
        Arc::new(self.metadata.clone())
    }

    async fn blob_log(&self) -> Result<Option<Arc<dyn BlockLog>>> {
        Ok(self
            .blobs
            .as_ref()
            .map(|log| Arc::new(log.clone()) as Arc<dyn BlockLog>))
    }

    async fn metadata_value(&self, key: &str) -> Result<Option<WarmupPayload>> {
        Ok(self.values.read().get(key).cloned())
    }
}
