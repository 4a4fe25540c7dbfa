use crate::datum::{KindCounts, PointKind};
use metrics::{Counter, Gauge, Histogram, Label};
use std::sync::Mutex;

/// The per-endpoint meter bundle. Handles are resolved once at queue-manager
/// construction, labelled by the client's `remote_name` and `url`; how they
/// are surfaced (exporter, registry) is up to the embedding process.
pub(crate) struct Telemetry {
    pub sent_samples: Counter,
    pub sent_exemplars: Counter,
    pub sent_histograms: Counter,
    pub sent_metadata: Counter,

    pub failed_samples: Counter,
    pub failed_exemplars: Counter,
    pub failed_histograms: Counter,
    pub failed_metadata: Counter,

    pub retried_samples: Counter,
    pub retried_exemplars: Counter,
    pub retried_histograms: Counter,
    pub retried_metadata: Counter,

    // Points dropped by the retry-path age filter, reason="too_old".
    pub dropped_samples_too_old: Counter,
    pub dropped_exemplars_too_old: Counter,
    pub dropped_histograms_too_old: Counter,

    pub enqueue_retries: Counter,

    pub pending_samples: Gauge,
    pub pending_exemplars: Gauge,
    pub pending_histograms: Gauge,

    pub shards: Gauge,
    pub shards_min: Gauge,
    pub shards_max: Gauge,
    pub shards_desired: Gauge,
    pub shard_capacity: Gauge,
    pub max_samples_per_send: Gauge,

    pub sent_batch_duration: Histogram,
    pub sent_bytes: Counter,
    pub metadata_bytes: Counter,

    pub highest_sent_timestamp: MaxTimestamp,
    pub highest_recv_timestamp: MaxTimestamp,
}

impl Telemetry {
    pub fn new(remote_name: &str, endpoint: &str) -> Self {
        let base = vec![
            Label::new("remote_name", remote_name.to_string()),
            Label::new("url", endpoint.to_string()),
        ];
        let counter = |name: &'static str| metrics::counter!(name, base.clone());
        let gauge = |name: &'static str| metrics::gauge!(name, base.clone());
        let too_old = |name: &'static str| {
            let mut labels = base.clone();
            labels.push(Label::new("reason", "too_old"));
            metrics::counter!(name, labels)
        };

        Self {
            sent_samples: counter("remote_write_samples_total"),
            sent_exemplars: counter("remote_write_exemplars_total"),
            sent_histograms: counter("remote_write_histograms_total"),
            sent_metadata: counter("remote_write_metadata_total"),

            failed_samples: counter("remote_write_samples_failed_total"),
            failed_exemplars: counter("remote_write_exemplars_failed_total"),
            failed_histograms: counter("remote_write_histograms_failed_total"),
            failed_metadata: counter("remote_write_metadata_failed_total"),

            retried_samples: counter("remote_write_samples_retried_total"),
            retried_exemplars: counter("remote_write_exemplars_retried_total"),
            retried_histograms: counter("remote_write_histograms_retried_total"),
            retried_metadata: counter("remote_write_metadata_retried_total"),

            dropped_samples_too_old: too_old("remote_write_samples_dropped_total"),
            dropped_exemplars_too_old: too_old("remote_write_exemplars_dropped_total"),
            dropped_histograms_too_old: too_old("remote_write_histograms_dropped_total"),

            enqueue_retries: counter("remote_write_enqueue_retries_total"),

            pending_samples: gauge("remote_write_pending_samples"),
            pending_exemplars: gauge("remote_write_pending_exemplars"),
            pending_histograms: gauge("remote_write_pending_histograms"),

            shards: gauge("remote_write_shards"),
            shards_min: gauge("remote_write_shards_min"),
            shards_max: gauge("remote_write_shards_max"),
            shards_desired: gauge("remote_write_shards_desired"),
            shard_capacity: gauge("remote_write_shard_capacity"),
            max_samples_per_send: gauge("remote_write_max_samples_per_send"),

            sent_batch_duration: metrics::histogram!(
                "remote_write_sent_batch_duration_seconds",
                base.clone()
            ),
            sent_bytes: counter("remote_write_bytes_total"),
            metadata_bytes: counter("remote_write_metadata_bytes_total"),

            highest_sent_timestamp: MaxTimestamp::new(gauge(
                "remote_write_queue_highest_sent_timestamp_seconds",
            )),
            highest_recv_timestamp: MaxTimestamp::new(gauge(
                "remote_write_queue_highest_recv_timestamp_seconds",
            )),
        }
    }

    pub fn pending(&self, kind: PointKind) -> &Gauge {
        match kind {
            PointKind::Sample => &self.pending_samples,
            PointKind::Exemplar => &self.pending_exemplars,
            PointKind::Histogram => &self.pending_histograms,
        }
    }

    pub fn incr_sent(&self, counts: KindCounts) {
        self.sent_samples.increment(counts.samples as u64);
        self.sent_exemplars.increment(counts.exemplars as u64);
        self.sent_histograms.increment(counts.histograms as u64);
    }

    pub fn incr_failed(&self, counts: KindCounts) {
        self.failed_samples.increment(counts.samples as u64);
        self.failed_exemplars.increment(counts.exemplars as u64);
        self.failed_histograms.increment(counts.histograms as u64);
    }

    pub fn incr_retried(&self, counts: KindCounts) {
        self.retried_samples.increment(counts.samples as u64);
        self.retried_exemplars.increment(counts.exemplars as u64);
        self.retried_histograms.increment(counts.histograms as u64);
    }

    pub fn incr_dropped_too_old(&self, counts: KindCounts) {
        self.dropped_samples_too_old.increment(counts.samples as u64);
        self.dropped_exemplars_too_old.increment(counts.exemplars as u64);
        self.dropped_histograms_too_old.increment(counts.histograms as u64);
    }

    pub fn decr_pending(&self, counts: KindCounts) {
        self.pending_samples.decrement(counts.samples as f64);
        self.pending_exemplars.decrement(counts.exemplars as f64);
        self.pending_histograms.decrement(counts.histograms as f64);
    }
}

/// A gauge tracking the monotonic maximum of reported values, with the
/// current maximum readable back out (the rescaler consumes it).
pub(crate) struct MaxTimestamp {
    gauge: Gauge,
    max: Mutex<f64>,
}

impl MaxTimestamp {
    fn new(gauge: Gauge) -> Self {
        Self {
            gauge,
            max: Mutex::new(0.0),
        }
    }

    pub fn set_max(&self, seconds: f64) {
        let mut max = self.max.lock().unwrap();
        if seconds > *max {
            *max = seconds;
            self.gauge.set(seconds);
        }
    }

    pub fn get(&self) -> f64 {
        *self.max.lock().unwrap()
    }
}
