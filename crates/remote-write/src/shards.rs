use crate::datum::{Datum, KindCounts, PointKind};
use crate::manager::SendContext;
use crate::queue::BatchQueue;
use crate::worker::ShardWorker;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Shared accounting for one generation of shards: how many points are
/// enqueued-but-unsent, and how many were lost to a hard shutdown.
#[derive(Default)]
pub(crate) struct ShardCounters {
    pub enqueued_samples: AtomicI64,
    pub enqueued_exemplars: AtomicI64,
    pub enqueued_histograms: AtomicI64,

    pub dropped_samples: AtomicU64,
    pub dropped_exemplars: AtomicU64,
    pub dropped_histograms: AtomicU64,
}

impl ShardCounters {
    pub fn incr_enqueued(&self, kind: PointKind) {
        match kind {
            PointKind::Sample => &self.enqueued_samples,
            PointKind::Exemplar => &self.enqueued_exemplars,
            PointKind::Histogram => &self.enqueued_histograms,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn sub_enqueued(&self, counts: KindCounts) {
        self.enqueued_samples
            .fetch_sub(counts.samples as i64, Ordering::Relaxed);
        self.enqueued_exemplars
            .fetch_sub(counts.exemplars as i64, Ordering::Relaxed);
        self.enqueued_histograms
            .fetch_sub(counts.histograms as i64, Ordering::Relaxed);
    }

    pub fn add_dropped_on_hard_shutdown(&self, counts: KindCounts) {
        self.dropped_samples
            .fetch_add(counts.samples as u64, Ordering::Relaxed);
        self.dropped_exemplars
            .fetch_add(counts.exemplars as u64, Ordering::Relaxed);
        self.dropped_histograms
            .fetch_add(counts.histograms as u64, Ordering::Relaxed);
    }
}

struct ShardState {
    queues: Vec<Arc<BatchQueue>>,
    soft_shutdown: CancellationToken,
    hard_shutdown: CancellationToken,
    done: CancellationToken,
    counters: Arc<ShardCounters>,
}

/// The collection of live shards: routing, lifecycle, and the two-phase
/// shutdown. Enqueues take the shared lock; start/stop take the exclusive
/// lock, so restructuring only happens once every producer has either
/// completed or observed the soft shutdown and bailed out.
pub(crate) struct ShardSet {
    cx: Arc<SendContext>,
    state: RwLock<Option<ShardState>>,
}

impl ShardSet {
    pub fn new(cx: Arc<SendContext>) -> Self {
        Self {
            cx,
            state: RwLock::new(None),
        }
    }

    /// (Re)create `n` queues with fresh shutdown signals and counters, and
    /// launch one worker per queue.
    pub async fn start(&self, n: usize) {
        let mut guard = self.state.write().await;

        let soft_shutdown = CancellationToken::new();
        let hard_shutdown = CancellationToken::new();
        let done = CancellationToken::new();
        let counters = Arc::new(ShardCounters::default());
        let running = Arc::new(AtomicUsize::new(n));

        let mut queues = Vec::with_capacity(n);
        for shard in 0..n {
            let (queue, rx) = BatchQueue::new(
                self.cx.cfg.capacity,
                self.cx.cfg.max_samples_per_send,
            );
            let queue = Arc::new(queue);
            tokio::spawn(
                ShardWorker {
                    shard,
                    queue: queue.clone(),
                    rx,
                    counters: counters.clone(),
                    hard_shutdown: hard_shutdown.clone(),
                    done: done.clone(),
                    running: running.clone(),
                    cx: self.cx.clone(),
                }
                .run(),
            );
            queues.push(queue);
        }

        self.cx.telemetry.shards.set(n as f64);
        *guard = Some(ShardState {
            queues,
            soft_shutdown,
            hard_shutdown,
            done,
            counters,
        });
        tracing::info!(shards = n, "started shard workers");
    }

    /// Route one point to its shard. Fails fast once the soft shutdown has
    /// fired, handing the point back so the producer can retry or abort.
    pub async fn enqueue(&self, datum: Datum) -> Result<(), Datum> {
        let guard = self.state.read().await;
        let Some(state) = guard.as_ref() else {
            return Err(datum);
        };
        if state.soft_shutdown.is_cancelled() {
            return Err(datum);
        }

        let shard = (datum.series.signature() % state.queues.len() as u64) as usize;
        let kind = datum.value.kind();
        state.queues[shard].append(datum)?;

        state.counters.incr_enqueued(kind);
        self.cx.telemetry.pending(kind).increment(1.0);
        Ok(())
    }

    /// Two-phase shutdown: stop accepting, drain within the flush deadline,
    /// then cancel whatever is still in flight and account the loss.
    pub async fn stop(&self) {
        {
            let guard = self.state.read().await;
            let Some(state) = guard.as_ref() else {
                return;
            };
            state.soft_shutdown.cancel();
        }

        // Producers now fail fast, so the exclusive lock can be taken
        // without racing an append into a closing queue.
        let mut guard = self.state.write().await;
        let Some(state) = guard.take() else {
            return;
        };

        // Flush queues concurrently: the deadline below bounds the union of
        // the flushes, not their sum.
        for queue in &state.queues {
            let queue = queue.clone();
            let done = state.done.clone();
            tokio::spawn(async move { queue.flush_and_shutdown(done).await });
        }

        let flush_deadline = self.cx.cfg.flush_deadline;
        if tokio::time::timeout(flush_deadline, state.done.cancelled())
            .await
            .is_err()
        {
            tracing::warn!("flush deadline exceeded, forcing hard shutdown");
            state.hard_shutdown.cancel();
            state.done.cancelled().await;
        }

        let samples = state.counters.dropped_samples.load(Ordering::Relaxed);
        if samples > 0 {
            tracing::error!(count = samples, "failed to flush all samples on shutdown");
        }
        let exemplars = state.counters.dropped_exemplars.load(Ordering::Relaxed);
        if exemplars > 0 {
            tracing::error!(count = exemplars, "failed to flush all exemplars on shutdown");
        }
        let histograms = state.counters.dropped_histograms.load(Ordering::Relaxed);
        if histograms > 0 {
            tracing::error!(count = histograms, "failed to flush all histograms on shutdown");
        }
    }

    #[cfg(test)]
    pub(crate) async fn counters(&self) -> Option<Arc<ShardCounters>> {
        self.state.read().await.as_ref().map(|s| s.counters.clone())
    }

    #[cfg(test)]
    pub(crate) async fn shard_count(&self) -> usize {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.queues.len())
            .unwrap_or(0)
    }
}
