use crate::config::{ConfigError, QueueConfig};
use crate::datum::{Datum, MetricMetadata};
use crate::ewma::EwmaRate;
use crate::rescale::{self, Rescaler, EWMA_WEIGHT, SHARD_UPDATE_INTERVAL};
use crate::sender::{self, send_with_backoff, BackoffSend, Error, RequestEncoder, WriteClient};
use crate::shards::ShardSet;
use crate::telemetry::Telemetry;
use async_trait::async_trait;
use bytes::Bytes;
use labels::LabelSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// State shared between the façade, the shard workers, and the rescaler.
pub(crate) struct SendContext {
    pub cfg: QueueConfig,
    pub encoder: Arc<dyn RequestEncoder>,
    client: RwLock<Arc<dyn WriteClient>>,
    pub telemetry: Telemetry,

    pub data_in: EwmaRate,
    pub data_out: EwmaRate,
    pub data_dropped: EwmaRate,
    pub data_out_duration: EwmaRate,

    /// Unix seconds of the most recently completed send attempt chain.
    pub last_send_timestamp: AtomicI64,
    /// Lowest timestamp (ms) observed while building the current request;
    /// gates the retry-path age filter.
    pub build_request_limit_timestamp: AtomicI64,
}

impl SendContext {
    pub fn new(
        cfg: QueueConfig,
        client: Arc<dyn WriteClient>,
        encoder: Arc<dyn RequestEncoder>,
    ) -> Self {
        let telemetry = Telemetry::new(client.name(), client.endpoint());
        Self {
            cfg,
            encoder,
            client: RwLock::new(client),
            telemetry,
            data_in: EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
            data_out: EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
            data_dropped: EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
            data_out_duration: EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
            last_send_timestamp: AtomicI64::new(0),
            build_request_limit_timestamp: AtomicI64::new(0),
        }
    }

    pub fn client(&self) -> Arc<dyn WriteClient> {
        self.client.read().unwrap().clone()
    }

    pub fn set_client(&self, client: Arc<dyn WriteClient>) {
        *self.client.write().unwrap() = client;
    }
}

/// The public surface of one remote-write queue: accepts points from the
/// upstream producer, shards and batches them, and ships them to the remote
/// endpoint with adaptive parallelism and bounded-loss shutdown.
///
/// Created once per remote endpoint. [`QueueManager::stop`] must run before
/// the manager is dropped, or its background tasks are left to exit on
/// their own.
pub struct QueueManager {
    cx: Arc<SendContext>,
    shards: Arc<ShardSet>,
    num_shards: Arc<AtomicUsize>,
    external_labels: LabelSet,
    quit: CancellationToken,
    reshard_tx: mpsc::Sender<usize>,
    reshard_rx: Mutex<Option<mpsc::Receiver<usize>>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl QueueManager {
    pub fn new(
        cfg: QueueConfig,
        external_labels: LabelSet,
        client: Arc<dyn WriteClient>,
        encoder: Arc<dyn RequestEncoder>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let min_shards = cfg.min_shards;
        let cx = Arc::new(SendContext::new(cfg, client, encoder));
        let shards = Arc::new(ShardSet::new(cx.clone()));
        let (reshard_tx, reshard_rx) = mpsc::channel(1);

        Ok(Self {
            cx,
            shards,
            num_shards: Arc::new(AtomicUsize::new(min_shards)),
            external_labels,
            quit: CancellationToken::new(),
            reshard_tx,
            reshard_rx: Mutex::new(Some(reshard_rx)),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Snapshot config meters, start the shard set at `min_shards`, and
    /// launch the rescale and reshard tasks. Idempotent.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let cfg = &self.cx.cfg;
        let telemetry = &self.cx.telemetry;
        telemetry.shard_capacity.set(cfg.capacity as f64);
        telemetry.max_samples_per_send.set(cfg.max_samples_per_send as f64);
        telemetry.shards_min.set(cfg.min_shards as f64);
        telemetry.shards_max.set(cfg.max_shards as f64);
        telemetry.shards_desired.set(cfg.min_shards as f64);

        self.num_shards.store(cfg.min_shards, Ordering::Relaxed);
        self.shards.start(cfg.min_shards).await;

        let rescaler = Rescaler {
            cx: self.cx.clone(),
            num_shards: self.num_shards.clone(),
            reshard_tx: self.reshard_tx.clone(),
            quit: self.quit.clone(),
        };
        let update_task = tokio::spawn(rescaler.run());

        let reshard_rx = self.reshard_rx.lock().unwrap().take();
        let Some(reshard_rx) = reshard_rx else {
            return;
        };
        let reshard_task = tokio::spawn(rescale::run_reshard_loop(
            self.shards.clone(),
            reshard_rx,
            self.quit.clone(),
        ));
        self.tasks
            .lock()
            .await
            .extend([update_task, reshard_task]);

        let client = self.cx.client();
        tracing::info!(
            remote_name = client.name(),
            endpoint = client.endpoint(),
            shards = cfg.min_shards,
            "started remote-write queue manager"
        );
    }

    /// Stop the background tasks, then run the shard set's two-phase
    /// shutdown. Data still buffered past the flush deadline is dropped
    /// and accounted.
    pub async fn stop(&self) {
        tracing::info!("stopping remote-write queue manager");
        self.quit.cancel();
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        // The rescale loops are down: no reshard can race this final stop.
        self.shards.stop().await;
        tracing::info!("remote-write queue manager stopped");
    }

    /// Enqueue samples, blocking (with backoff) while shards are full.
    /// Returns false only when the manager is shutting down.
    pub async fn append(&self, samples: Vec<Datum>) -> bool {
        self.append_with_backoff(samples, Duration::from_millis(5))
            .await
    }

    pub async fn append_exemplars(&self, exemplars: Vec<Datum>) -> bool {
        if !self.cx.cfg.send_exemplars {
            return true;
        }
        self.append_with_backoff(exemplars, self.cx.cfg.min_backoff)
            .await
    }

    pub async fn append_histograms(&self, histograms: Vec<Datum>) -> bool {
        if !self.cx.cfg.send_native_histograms {
            return true;
        }
        self.append_with_backoff(histograms, Duration::from_millis(5))
            .await
    }

    pub async fn append_float_histograms(&self, histograms: Vec<Datum>) -> bool {
        if !self.cx.cfg.send_native_histograms {
            return true;
        }
        self.append_with_backoff(histograms, Duration::from_millis(5))
            .await
    }

    async fn append_with_backoff(&self, points: Vec<Datum>, initial_backoff: Duration) -> bool {
        'points: for mut datum in points {
            datum.series = datum.series.with_defaults(&self.external_labels);
            self.cx
                .telemetry
                .highest_recv_timestamp
                .set_max(datum.timestamp_ms as f64 / 1000.0);
            self.cx.data_in.incr(1);

            let mut backoff = initial_backoff;
            loop {
                if self.quit.is_cancelled() {
                    return false;
                }
                datum = match self.shards.enqueue(datum).await {
                    Ok(()) => continue 'points,
                    Err(returned) => returned,
                };
                // A full shard is backpressure, not loss: hold the point
                // and retry until it fits or the manager quits.
                self.cx.telemetry.enqueue_retries.increment(1);
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, self.cx.cfg.max_backoff);
            }
        }
        true
    }

    /// Ship metric metadata directly, bypassing the shards. Chunks of
    /// `max_samples_per_send` entries each go through the backoff sender; a
    /// failed chunk is counted and logged without blocking later chunks.
    pub async fn append_metadata(&self, metadata: Vec<MetricMetadata>) {
        if metadata.is_empty() {
            return;
        }
        for chunk in metadata.chunks(self.cx.cfg.max_samples_per_send) {
            if let Err(err) = self.send_metadata_with_backoff(chunk).await {
                self.cx
                    .telemetry
                    .failed_metadata
                    .increment(chunk.len() as u64);
                tracing::error!(
                    count = chunk.len(),
                    ?err,
                    "non-recoverable error sending metadata"
                );
            }
        }
    }

    async fn send_metadata_with_backoff(&self, metadata: &[MetricMetadata]) -> Result<(), Error> {
        let encoded = self
            .cx
            .encoder
            .encode(&[], metadata, None)
            .map_err(Error::Encode)?;
        let request_size = encoded.payload.len();

        let mut op = MetadataSend {
            cx: &self.cx,
            quit: &self.quit,
            payload: encoded.payload,
            count: metadata.len(),
        };
        send_with_backoff(
            self.cx.cfg.min_backoff,
            self.cx.cfg.max_backoff,
            &self.quit,
            &mut op,
        )
        .await?;

        self.cx
            .telemetry
            .sent_metadata
            .increment(metadata.len() as u64);
        self.cx
            .telemetry
            .metadata_bytes
            .increment(request_size as u64);
        Ok(())
    }

    /// Swap the write client. Reshards and in-flight sends keep the client
    /// they already resolved; new sends pick up the replacement.
    pub fn set_client(&self, client: Arc<dyn WriteClient>) {
        self.cx.set_client(client);
    }

    /// The arrival-rate meter. The upstream producer that replays into
    /// `append*` owns its tick cadence, which must match the rescaler's
    /// update interval.
    pub fn data_in(&self) -> &EwmaRate {
        &self.cx.data_in
    }
}

struct MetadataSend<'m> {
    cx: &'m SendContext,
    quit: &'m CancellationToken,
    payload: Bytes,
    count: usize,
}

#[async_trait]
impl BackoffSend for MetadataSend<'_> {
    async fn attempt(&mut self, attempt: u32) -> Result<(), Error> {
        let begin = Instant::now();
        let client = self.cx.client();
        let result = tokio::select! {
            () = self.quit.cancelled() => Err(Error::Canceled),
            result = client.store(self.payload.clone(), attempt) => result,
        };
        self.cx
            .telemetry
            .sent_batch_duration
            .record(begin.elapsed().as_secs_f64());
        result
    }

    fn on_retry(&mut self) {
        self.cx
            .telemetry
            .retried_metadata
            .increment(self.count as u64);
    }
}
