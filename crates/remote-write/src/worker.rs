use crate::datum::{
    Datum, ExemplarPoint, HistogramPoint, HistogramValue, KindCounts, Payload, SamplePoint,
    TimeSeriesEntry,
};
use crate::manager::SendContext;
use crate::queue::BatchQueue;
use crate::sender::{self, send_with_backoff, AgeFilter, BackoffSend, Error};
use crate::shards::ShardCounters;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One worker task bound to one shard's queue: drains full batches,
/// transcodes them to wire form, and ships them through the backoff sender.
pub(crate) struct ShardWorker {
    pub shard: usize,
    pub queue: Arc<BatchQueue>,
    pub rx: mpsc::Receiver<Vec<Datum>>,
    pub counters: Arc<ShardCounters>,
    pub hard_shutdown: CancellationToken,
    pub done: CancellationToken,
    pub running: Arc<AtomicUsize>,
    pub cx: Arc<SendContext>,
}

impl ShardWorker {
    pub async fn run(mut self) {
        self.run_loop().await;
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.cancel();
        }
        tracing::debug!(shard = self.shard, "shard worker exited");
    }

    async fn run_loop(&mut self) {
        let deadline = self.cx.cfg.batch_send_deadline;
        let mut pending = PendingBatch::new(
            self.cx.cfg.max_samples_per_send,
            self.cx.cfg.send_exemplars,
        );
        let timer = tokio::time::sleep(deadline);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                // Hard shutdown outranks further sends.
                biased;

                () = self.hard_shutdown.cancelled() => {
                    self.drop_residual();
                    return;
                }

                received = self.rx.recv() => {
                    let Some(mut batch) = received else {
                        // Hand-off closed and fully drained: clean exit.
                        return;
                    };
                    let counts = pending.populate(&mut batch);
                    self.queue.return_for_reuse(batch);
                    self.send_batch(&pending, counts).await;
                    timer.as_mut().reset(tokio::time::Instant::now() + deadline);
                }

                () = &mut timer => {
                    let mut batch = match self.rx.try_recv() {
                        Ok(batch) => batch,
                        Err(_) => self.queue.take_partial(),
                    };
                    if !batch.is_empty() {
                        let counts = pending.populate(&mut batch);
                        tracing::debug!(
                            shard = self.shard,
                            points = counts.total(),
                            "flushing batch on send deadline"
                        );
                        self.queue.return_for_reuse(batch);
                        self.send_batch(&pending, counts).await;
                    } else {
                        self.queue.return_for_reuse(batch);
                    }
                    timer.as_mut().reset(tokio::time::Instant::now() + deadline);
                }
            }
        }
    }

    /// Ship one transcoded batch and settle its accounting. The shard-sizing
    /// meters and pending counters move on every outcome; delivery counters
    /// only on a definite success or definite failure.
    async fn send_batch(&self, pending: &PendingBatch, counts: KindCounts) {
        let begin = Instant::now();
        let result = self.send_entries_with_backoff(pending.entries(), counts).await;

        match &result {
            Ok(()) => self.cx.telemetry.incr_sent(counts),
            Err(Error::Canceled) => {
                // Reshard or hard shutdown: the batch neither landed nor
                // failed, and counters must not claim either way.
            }
            Err(err) => {
                tracing::error!(
                    shard = self.shard,
                    samples = counts.samples,
                    exemplars = counts.exemplars,
                    histograms = counts.histograms,
                    ?err,
                    "non-recoverable error sending batch"
                );
                self.cx.telemetry.incr_failed(counts);
            }
        }

        self.cx.data_out.incr(counts.total() as i64);
        self.cx.data_out_duration.incr(begin.elapsed().as_nanos() as i64);
        self.cx
            .last_send_timestamp
            .store(sender::unix_secs(), Ordering::Relaxed);

        self.cx.telemetry.decr_pending(counts);
        self.counters.sub_enqueued(counts);
    }

    async fn send_entries_with_backoff(
        &self,
        entries: &[TimeSeriesEntry],
        counts: KindCounts,
    ) -> Result<(), Error> {
        let encoded = self
            .cx
            .encoder
            .encode(entries, &[], None)
            .map_err(Error::Encode)?;
        self.cx
            .build_request_limit_timestamp
            .store(encoded.lowest_timestamp_ms, Ordering::Relaxed);
        let highest_ms = encoded.highest_timestamp_ms;

        let mut op = BatchSend {
            cx: &self.cx,
            hard_shutdown: &self.hard_shutdown,
            entries,
            counts,
            payload: encoded.payload,
        };
        let result = send_with_backoff(
            self.cx.cfg.min_backoff,
            self.cx.cfg.max_backoff,
            &self.hard_shutdown,
            &mut op,
        )
        .await;

        if result.is_ok() {
            self.cx.telemetry.sent_bytes.increment(op.payload.len() as u64);
            self.cx
                .telemetry
                .highest_sent_timestamp
                .set_max(highest_ms as f64 / 1000.0);
        }
        result
    }

    // Hard shutdown: everything still buffered in this shard is dropped,
    // taken out of pending, and accounted as failed.
    fn drop_residual(&mut self) {
        let mut dropped = KindCounts::default();
        while let Ok(batch) = self.rx.try_recv() {
            for datum in &batch {
                dropped.bump(datum.value.kind());
            }
        }
        for datum in &self.queue.take_partial() {
            dropped.bump(datum.value.kind());
        }
        if dropped.total() == 0 {
            return;
        }

        tracing::debug!(
            shard = self.shard,
            samples = dropped.samples,
            exemplars = dropped.exemplars,
            histograms = dropped.histograms,
            "dropping buffered data on hard shutdown"
        );
        self.cx.telemetry.decr_pending(dropped);
        self.cx.telemetry.incr_failed(dropped);
        self.counters.sub_enqueued(dropped);
        self.counters.add_dropped_on_hard_shutdown(dropped);
    }
}

/// The reusable transcoding buffer of one worker, sized to the batch limit
/// plus headroom for exemplars when those are enabled.
struct PendingBatch {
    entries: Vec<TimeSeriesEntry>,
    len: usize,
}

impl PendingBatch {
    fn new(max_samples_per_send: usize, send_exemplars: bool) -> Self {
        let mut capacity = max_samples_per_send;
        if send_exemplars {
            capacity += max_samples_per_send / 10;
        }
        Self {
            entries: vec![TimeSeriesEntry::default(); capacity],
            len: 0,
        }
    }

    /// Move each point of `batch` into the next entry, clearing whatever the
    /// entry held from the previous send. Returns per-kind counts of what
    /// was populated.
    fn populate(&mut self, batch: &mut Vec<Datum>) -> KindCounts {
        debug_assert!(batch.len() <= self.entries.len());
        self.len = 0;
        let mut counts = KindCounts::default();

        for datum in batch.drain(..) {
            counts.bump(datum.value.kind());
            let entry = &mut self.entries[self.len];
            entry.samples.clear();
            entry.exemplars.clear();
            entry.histograms.clear();
            entry.labels = datum.series;

            match datum.value {
                Payload::Sample { value } => entry.samples.push(SamplePoint {
                    value,
                    timestamp_ms: datum.timestamp_ms,
                }),
                Payload::Exemplar { labels, value } => entry.exemplars.push(ExemplarPoint {
                    labels,
                    value,
                    timestamp_ms: datum.timestamp_ms,
                }),
                Payload::Histogram(histogram) => entry.histograms.push(HistogramPoint {
                    timestamp_ms: datum.timestamp_ms,
                    histogram: HistogramValue::Integer(histogram),
                }),
                Payload::FloatHistogram(histogram) => entry.histograms.push(HistogramPoint {
                    timestamp_ms: datum.timestamp_ms,
                    histogram: HistogramValue::Float(histogram),
                }),
            }
            self.len += 1;
        }
        counts
    }

    fn entries(&self) -> &[TimeSeriesEntry] {
        &self.entries[..self.len]
    }
}

struct BatchSend<'w> {
    cx: &'w SendContext,
    hard_shutdown: &'w CancellationToken,
    entries: &'w [TimeSeriesEntry],
    counts: KindCounts,
    payload: Bytes,
}

#[async_trait]
impl BackoffSend for BatchSend<'_> {
    async fn attempt(&mut self, attempt: u32) -> Result<(), Error> {
        // A fresh batch always ships all of its points; only retries drop
        // points that aged out while the remote kept failing.
        let age_limit = self.cx.cfg.sample_age_limit;
        if attempt > 0 && !age_limit.is_zero() {
            let cutoff_ms = sender::unix_ms() - age_limit.as_millis() as i64;
            if self
                .cx
                .build_request_limit_timestamp
                .load(Ordering::Relaxed)
                < cutoff_ms
            {
                self.rebuild_dropping_aged(cutoff_ms)?;
            }
        }

        let begin = Instant::now();
        let client = self.cx.client();
        let result = tokio::select! {
            () = self.hard_shutdown.cancelled() => Err(Error::Canceled),
            result = client.store(self.payload.clone(), attempt) => result,
        };
        self.cx
            .telemetry
            .sent_batch_duration
            .record(begin.elapsed().as_secs_f64());
        result
    }

    fn on_retry(&mut self) {
        self.cx.telemetry.incr_retried(self.counts);
    }
}

impl BatchSend<'_> {
    fn rebuild_dropping_aged(&mut self, cutoff_ms: i64) -> Result<(), Error> {
        let encoded = self
            .cx
            .encoder
            .encode(
                self.entries,
                &[],
                Some(AgeFilter {
                    min_timestamp_ms: cutoff_ms,
                }),
            )
            .map_err(Error::Encode)?;
        self.cx
            .build_request_limit_timestamp
            .store(encoded.lowest_timestamp_ms, Ordering::Relaxed);

        if encoded.dropped.total() > 0 {
            tracing::debug!(
                samples = encoded.dropped.samples,
                exemplars = encoded.dropped.exemplars,
                histograms = encoded.dropped.histograms,
                "dropped aged points while rebuilding request"
            );
            self.cx.telemetry.incr_dropped_too_old(encoded.dropped);
            self.cx.data_dropped.incr(encoded.dropped.total() as i64);
        }
        self.payload = encoded.payload;
        Ok(())
    }
}
