// Resolved log handles for one run; an absent blob log contributes nothing.

use std::sync::Arc;

use tracing::debug;

use super::ranges::{prepare_ranges, JobGuard, PreparedSpans};
use crate::error::{LogKind, PrefetchError};
use crate::plan::Span;
use crate::source::traits::{BlockLog, DownloadJob, ListenerId, TransferListener};

/// Deregisters a listener from its log when dropped.
pub struct ListenerGuard {
    log: Arc<dyn BlockLog>,
    id: ListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.log.remove_listener(self.id);
    }
}

pub struct LogSet {
    metadata: Arc<dyn BlockLog>,
    blobs: Option<Arc<dyn BlockLog>>,
}

impl LogSet {
    pub fn new(metadata: Arc<dyn BlockLog>, blobs: Option<Arc<dyn BlockLog>>) -> Self {
        Self { metadata, blobs }
    }

    fn get(&self, kind: LogKind) -> Option<&Arc<dyn BlockLog>> {
        match kind {
            LogKind::Metadata => Some(&self.metadata),
            LogKind::Blobs => self.blobs.as_ref(),
        }
    }

    pub fn has_blobs(&self) -> bool {
        self.blobs.is_some()
    }

    pub fn metadata_peers(&self) -> usize {
        self.metadata.peer_count()
    }

    /// Register `listener` on every present log.
    pub fn listen(&self, listener: Arc<dyn TransferListener>) -> Vec<ListenerGuard> {
        [LogKind::Metadata, LogKind::Blobs]
            .into_iter()
            .filter_map(|kind| self.get(kind))
            .map(|log| ListenerGuard {
                log: Arc::clone(log),
                id: log.add_listener(Arc::clone(&listener)),
            })
            .collect()
    }

    pub async fn prepare(
        &self,
        kind: LogKind,
        spans: &[Span],
    ) -> Result<PreparedSpans, PrefetchError> {
        let Some(log) = self.get(kind) else {
            if !spans.is_empty() {
                debug!("no {} log, skipping {} spans", kind, spans.len());
            }
            return Ok(PreparedSpans::default());
        };
        prepare_ranges(spans, log.as_ref())
            .await
            .map_err(|e| PrefetchError::download(kind, e))
    }

    /// Issue one block-set download, or nothing if there is nothing to fetch.
    pub fn download_blocks(
        &self,
        kind: LogKind,
        blocks: &[u64],
    ) -> Option<JobGuard<dyn DownloadJob>> {
        if blocks.is_empty() {
            return None;
        }
        let log = self.get(kind)?;
        Some(JobGuard::new(log.download_blocks(blocks.to_vec())))
    }
}
