use crate::manager::SendContext;
use crate::sender;
use crate::shards::ShardSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Cadence of the shard-count control loop. `data_in` is expected to be
/// ticked on the same cadence by the upstream producer.
pub(crate) const SHARD_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Weight of each tick in the EWMA meters the control loop reads.
pub(crate) const EWMA_WEIGHT: f64 = 0.2;

// Desired counts within this fraction of the current count don't reshard.
const SHARD_TOLERANCE: f64 = 0.3;

// Never shed shards while more than this far behind the producer.
const MAX_DOWNSHARD_DELAY_SECONDS: f64 = 10.0;

// When behind, plan to catch up on this fraction of the backlog per second.
const BACKLOG_CATCHUP_FRACTION: f64 = 0.05;

/// The control loop deciding how many shards the queue should run. Wakes on
/// a fixed interval, folds the EWMA meters, and hands a changed desired
/// count to the reshard task; hysteresis keeps it from thrashing under
/// bursty load or a stalling remote.
pub(crate) struct Rescaler {
    pub cx: Arc<SendContext>,
    pub num_shards: Arc<AtomicUsize>,
    pub reshard_tx: mpsc::Sender<usize>,
    pub quit: CancellationToken,
}

impl Rescaler {
    pub async fn run(self) {
        let mut interval = tokio::time::interval(SHARD_UPDATE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.quit.cancelled() => return,
                _ = interval.tick() => {}
            }

            let current = self.num_shards.load(Ordering::Relaxed);
            let desired = self.calculate_desired_shards();
            if !self.should_reshard(desired) {
                continue;
            }

            // Resharding can take a while; if the reshard task is still busy
            // with the previous resize, skip rather than queue up stale
            // counts.
            match self.reshard_tx.try_send(desired) {
                Ok(()) => {
                    tracing::info!(from = current, to = desired, "resharding remote-write queue");
                    self.num_shards.store(desired, Ordering::Relaxed);
                }
                Err(_) => {
                    tracing::info!(desired, "currently resharding, skipping");
                }
            }
        }
    }

    /// Estimate the shard count needed to keep up with the producer, from
    /// the send rate, send latency, and how far behind the queue is.
    pub(crate) fn calculate_desired_shards(&self) -> usize {
        self.cx.data_out.tick();
        self.cx.data_dropped.tick();
        self.cx.data_out_duration.tick();

        let current = self.num_shards.load(Ordering::Relaxed);
        let data_in_rate = self.cx.data_in.rate();
        let data_out_rate = self.cx.data_out.rate();
        let data_kept_ratio = data_out_rate / (self.cx.data_dropped.rate() + data_out_rate);
        let data_out_duration = self.cx.data_out_duration.rate() / 1e9;
        let data_pending_rate = data_in_rate * data_kept_ratio - data_out_rate;
        let highest_sent = self.cx.telemetry.highest_sent_timestamp.get();
        let highest_recv = self.cx.telemetry.highest_recv_timestamp.get();
        let delay_seconds = highest_recv - highest_sent;
        let data_pending = delay_seconds * data_in_rate * data_kept_ratio;

        // Nothing has gone out: there is no signal to scale on.
        if data_out_rate <= 0.0 {
            return current;
        }

        let backlog_catchup = BACKLOG_CATCHUP_FRACTION * data_pending;
        let time_per_sample = data_out_duration / data_out_rate;
        let desired = time_per_sample * (data_in_rate * data_kept_ratio + backlog_catchup);
        self.cx.telemetry.shards_desired.set(desired);

        tracing::debug!(
            data_in_rate,
            data_out_rate,
            data_kept_ratio,
            data_out_duration,
            data_pending_rate,
            data_pending,
            delay_seconds,
            desired,
            "calculated desired shards"
        );

        let lower = current as f64 * (1.0 - SHARD_TOLERANCE);
        let upper = current as f64 * (1.0 + SHARD_TOLERANCE);
        let desired = desired.ceil();
        if lower <= desired && desired <= upper {
            return current;
        }

        let desired = desired as usize;
        if desired < current && delay_seconds > MAX_DOWNSHARD_DELAY_SECONDS {
            tracing::debug!(delay_seconds, "not downsharding, too far behind");
            return current;
        }
        desired.clamp(self.cx.cfg.min_shards, self.cx.cfg.max_shards)
    }

    /// A changed desired count still doesn't reshard while the remote has
    /// not accepted a send recently: restarting shards would only churn.
    pub(crate) fn should_reshard(&self, desired: usize) -> bool {
        if desired == self.num_shards.load(Ordering::Relaxed) {
            return false;
        }
        let min_send_timestamp =
            sender::unix_secs() - 2 * self.cx.cfg.batch_send_deadline.as_secs() as i64;
        let last_send_timestamp = self.cx.last_send_timestamp.load(Ordering::Relaxed);
        if last_send_timestamp < min_send_timestamp {
            tracing::warn!(
                last_send_timestamp,
                min_send_timestamp,
                "skipping reshard, last successful send was beyond threshold"
            );
            return false;
        }
        true
    }
}

/// Consume desired counts and restart the shard set at the new size. The
/// old shards stop fully before the new ones start, preserving within-shard
/// delivery order across the resize.
pub(crate) async fn run_reshard_loop(
    shards: Arc<ShardSet>,
    mut reshard_rx: mpsc::Receiver<usize>,
    quit: CancellationToken,
) {
    loop {
        let n = tokio::select! {
            () = quit.cancelled() => return,
            received = reshard_rx.recv() => match received {
                Some(n) => n,
                None => return,
            },
        };
        shards.stop().await;
        shards.start(n).await;
    }
}
