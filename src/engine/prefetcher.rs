// Prefetch orchestrator. One run per drive: plan, prepare, download, report.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::logs::LogSet;
use super::progress::ProgressEstimator;
use super::stats::{Stats, ThroughputSource, TransferAggregator};
use crate::config::{PrefetchConfig, WARMUP_KEY};
use crate::error::{LogKind, PrefetchError};
use crate::plan::{PlanDecodeError, WarmupPlan};
use crate::source::traits::{Drive, MirrorDelegate, MirrorDiff, MirrorMonitor};

/// Slots each subscriber keeps free for the terminal event.
const TERMINAL_RESERVE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Finishing,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub enum PrefetchEvent {
    /// Periodic snapshot, and the final one with `progress == 1`.
    Update(Stats),
    /// A file change reported by the mirror, passed through as-is.
    Mirror(MirrorDiff),
    /// The run rejected. Nothing follows.
    Failed(PrefetchError),
}

type Outcome = Option<Result<Stats, PrefetchError>>;

/// Shared completion handle. Every `start` call on one prefetcher gets a clone.
#[derive(Clone)]
pub struct PrefetchRun {
    outcome: watch::Receiver<Outcome>,
}

impl PrefetchRun {
    /// Wait for the run to finish, yielding the final snapshot.
    pub async fn wait(&self) -> Result<Stats, PrefetchError> {
        let mut outcome = self.outcome.clone();
        let settled = outcome.wait_for(Option::is_some).await;
        match settled {
            Ok(current) => (*current).clone().unwrap_or(Err(PrefetchError::Aborted)),
            Err(_) => Err(PrefetchError::Aborted),
        }
    }

    /// The outcome, if the run has already settled.
    pub fn outcome(&self) -> Outcome {
        self.outcome.borrow().clone()
    }

    /// Whether both handles refer to the same run.
    pub fn same_run(&self, other: &PrefetchRun) -> bool {
        self.outcome.same_channel(&other.outcome)
    }
}

/// Calls `destroy` on the mirror monitor when the run lets go of it.
struct MonitorGuard(Arc<dyn MirrorMonitor>);

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

struct Inner {
    drive: Arc<dyn Drive>,
    config: PrefetchConfig,
    state: Mutex<RunState>,
    run: Mutex<Option<PrefetchRun>>,
    stats: Mutex<Option<Stats>>,
    subscribers: Mutex<Vec<mpsc::Sender<PrefetchEvent>>>,
    cancel: CancellationToken,
}

/// Drives the warmup prefetch of one drive.
///
/// Dropping the prefetcher cancels an active run.
pub struct Prefetcher {
    inner: Arc<Inner>,
}

impl Prefetcher {
    pub fn new(drive: Arc<dyn Drive>, config: PrefetchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                drive,
                config,
                state: Mutex::new(RunState::Idle),
                run: Mutex::new(None),
                stats: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Receive snapshots, mirror changes and the failure signal.
    ///
    /// A receiver that falls behind misses snapshots and mirror changes but
    /// still gets the final event. Once every subscriber has gone away the run
    /// is cancelled.
    pub fn subscribe(&self) -> mpsc::Receiver<PrefetchEvent> {
        let (tx, rx) = mpsc::channel(self.inner.config.event_buffer.max(TERMINAL_RESERVE + 1));
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Begin the run. Later calls return the same run and ignore `mirror`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, mirror: Option<Arc<dyn MirrorDelegate>>) -> PrefetchRun {
        let mut run = self.inner.run.lock();
        if let Some(existing) = run.as_ref() {
            debug!("prefetch already started, returning existing run");
            return existing.clone();
        }

        let (tx, rx) = watch::channel(None);
        let handle = PrefetchRun { outcome: rx };
        *run = Some(handle.clone());
        self.inner.set_state(RunState::Starting);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = tokio::select! {
                r = inner.run(mirror) => r,
                _ = inner.cancel.cancelled() => Err(PrefetchError::Cancelled),
            };
            if let Err(e) = &result {
                warn!("prefetch failed: {}", e);
                inner.set_state(RunState::Failed);
                inner.publish_terminal(PrefetchEvent::Failed(e.clone()));
            }
            let _ = tx.send(Some(result));
        });

        handle
    }

    pub fn state(&self) -> RunState {
        *self.inner.state.lock()
    }

    /// Last published snapshot.
    pub fn stats(&self) -> Option<Stats> {
        *self.inner.stats.lock()
    }

    /// Abort the active run. Pending downloads are cancelled best-effort.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn set_state(&self, next: RunState) {
        let mut state = self.state.lock();
        debug!("prefetch state {:?} -> {:?}", *state, next);
        *state = next;
    }

    async fn run(&self, mirror: Option<Arc<dyn MirrorDelegate>>) -> Result<Stats, PrefetchError> {
        info!("prefetch starting (mirror={})", mirror.is_some());

        let (blob_log, payload) = tokio::try_join!(
            async {
                self.drive
                    .blob_log()
                    .await
                    .map_err(|e| PrefetchError::download(LogKind::Blobs, e))
            },
            async {
                self.drive
                    .metadata_value(WARMUP_KEY)
                    .await
                    .map_err(|e| PrefetchError::download(LogKind::Metadata, e))
            },
        )?;

        let monitor = match &mirror {
            Some(mirror) => {
                let monitor = mirror.monitor();
                monitor.preloaded().await;
                debug!("mirror monitor preloaded");
                Some(MonitorGuard(monitor))
            }
            None => None,
        };
        let throughput = match &monitor {
            Some(guard) => ThroughputSource::delegated(Arc::clone(&guard.0)),
            None => ThroughputSource::local(self.config.speed_window()),
        };
        let mut diffs = mirror.as_ref().and_then(|m| m.take_diffs());

        let payload = payload.ok_or(PlanDecodeError::MissingPlan)?;
        let plan = WarmupPlan::decode(&payload)?;
        debug!(
            "warmup plan: {} metadata spans, {} blob spans",
            plan.metadata.len(),
            plan.blobs.len()
        );

        let logs = LogSet::new(self.drive.metadata_log(), blob_log);
        let aggregator = Arc::new(TransferAggregator::new(throughput));
        let listeners = logs.listen(aggregator.clone());

        let (meta, blobs) = tokio::try_join!(
            logs.prepare(LogKind::Metadata, &plan.metadata),
            logs.prepare(LogKind::Blobs, &plan.blobs),
        )?;

        let mut estimator = ProgressEstimator::new();
        estimator.add_prepared(&meta);
        estimator.add_prepared(&blobs);

        self.set_state(RunState::Running);
        let meta_blocks = logs.download_blocks(LogKind::Metadata, &meta.blocks);
        let blob_blocks = logs.download_blocks(LogKind::Blobs, &blobs.blocks);
        info!(
            "prefetch running: {} blocks expected ({} ranges, {} single blocks, blobs={})",
            estimator.expected_blocks(),
            meta.ranges.len() + blobs.ranges.len(),
            meta.blocks.len() + blobs.blocks.len(),
            logs.has_blobs()
        );

        let snapshot = |finished| aggregator.snapshot(logs.metadata_peers(), &estimator, finished);

        let downloads = async {
            if let Some(mirror) = &mirror {
                mirror.done().await.map_err(PrefetchError::mirror)?;
            }
            if let Some(job) = &meta_blocks {
                job.done()
                    .await
                    .map_err(|e| PrefetchError::download(LogKind::Metadata, e))?;
            }
            if let Some(job) = &blob_blocks {
                job.done()
                    .await
                    .map_err(|e| PrefetchError::download(LogKind::Blobs, e))?;
            }
            for range in &meta.ranges {
                range
                    .done()
                    .await
                    .map_err(|e| PrefetchError::download(LogKind::Metadata, e))?;
            }
            for range in &blobs.ranges {
                range
                    .done()
                    .await
                    .map_err(|e| PrefetchError::download(LogKind::Blobs, e))?;
            }
            Ok::<(), PrefetchError>(())
        };
        tokio::pin!(downloads);

        let period = self.config.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let diffs_open = diffs.is_some();
            tokio::select! {
                result = &mut downloads => {
                    result?;
                    break;
                }
                _ = ticker.tick() => self.publish_tick(snapshot(false)),
                diff = next_diff(&mut diffs), if diffs_open => match diff {
                    Some(diff) => self.publish_diff(diff),
                    None => diffs = None,
                },
            }
        }

        if let Some(rx) = diffs.as_mut() {
            while let Ok(diff) = rx.try_recv() {
                self.publish_diff(diff);
            }
        }

        self.set_state(RunState::Finishing);
        drop(monitor);
        drop(listeners);

        let stats = snapshot(true);
        self.set_state(RunState::Finished);
        *self.stats.lock() = Some(stats);
        self.publish_terminal(PrefetchEvent::Update(stats));
        info!(
            "prefetch finished: {} blocks, {} bytes, {} peers",
            stats.download.blocks, stats.download.bytes, stats.peers
        );
        Ok(stats)
    }

    fn publish_tick(&self, stats: Stats) {
        *self.stats.lock() = Some(stats);
        self.offer(PrefetchEvent::Update(stats));
    }

    fn publish_diff(&self, diff: MirrorDiff) {
        self.offer(PrefetchEvent::Mirror(diff));
    }

    /// Non-blocking: a subscriber with no spare room skips this event.
    fn offer(&self, event: PrefetchEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| {
            if tx.capacity() <= TERMINAL_RESERVE {
                return !tx.is_closed();
            }
            !matches!(tx.try_send(event.clone()), Err(TrySendError::Closed(_)))
        });
        if subscribers.is_empty() {
            warn!("all prefetch subscribers are gone, cancelling run");
            self.cancel.cancel();
        }
    }

    /// Lands in the slot `offer` leaves free, so it never waits on a reader.
    fn publish_terminal(&self, event: PrefetchEvent) {
        for tx in self.subscribers.lock().iter() {
            if let Err(TrySendError::Full(_)) = tx.try_send(event.clone()) {
                warn!("prefetch subscriber full, terminal event dropped");
            }
        }
    }
}

async fn next_diff(diffs: &mut Option<mpsc::Receiver<MirrorDiff>>) -> Option<MirrorDiff> {
    match diffs {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
