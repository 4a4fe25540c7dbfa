use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("capacity must be positive")]
    ZeroCapacity,
    #[error("max_samples_per_send must be positive")]
    ZeroMaxSamplesPerSend,
    #[error("batch_send_deadline must be positive")]
    ZeroBatchSendDeadline,
    #[error("min_shards must be positive")]
    ZeroMinShards,
    #[error("min_shards ({min}) must not exceed max_shards ({max})")]
    ShardBounds { min: usize, max: usize },
    #[error("min_backoff must not exceed max_backoff")]
    BackoffBounds,
}

/// Tuning of one remote-write queue. Durations deserialize from humantime
/// strings ("5s", "30ms") so the struct can sit directly in operator config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Per-shard point-buffering target. The hand-off channel holds
    /// `ceil(capacity / max_samples_per_send)` full batches (minimum one).
    pub capacity: usize,
    /// Points per outgoing batch, and the base size of each worker's
    /// transcoding buffer.
    pub max_samples_per_send: usize,
    /// How long a partial batch may sit before being flushed. Twice this
    /// also gates resharding when the remote is stalling.
    #[serde(with = "humantime_serde")]
    pub batch_send_deadline: Duration,
    /// Shard-count clamp range; the initial count is `min_shards`.
    pub min_shards: usize,
    pub max_shards: usize,
    /// Retry backoff bounds for the send loop.
    #[serde(with = "humantime_serde")]
    pub min_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// On retry, points older than this are dropped from the rebuilt
    /// request. Zero disables age filtering.
    #[serde(with = "humantime_serde")]
    pub sample_age_limit: Duration,
    /// How long a stop waits for shards to drain before hard shutdown.
    #[serde(with = "humantime_serde")]
    pub flush_deadline: Duration,
    pub send_exemplars: bool,
    pub send_native_histograms: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_samples_per_send: 2_000,
            batch_send_deadline: Duration::from_secs(5),
            min_shards: 1,
            max_shards: 50,
            min_backoff: Duration::from_millis(30),
            max_backoff: Duration::from_secs(5),
            sample_age_limit: Duration::ZERO,
            flush_deadline: Duration::from_secs(60),
            send_exemplars: false,
            send_native_histograms: false,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.max_samples_per_send == 0 {
            return Err(ConfigError::ZeroMaxSamplesPerSend);
        }
        if self.batch_send_deadline.is_zero() {
            return Err(ConfigError::ZeroBatchSendDeadline);
        }
        if self.min_shards == 0 {
            return Err(ConfigError::ZeroMinShards);
        }
        if self.min_shards > self.max_shards {
            return Err(ConfigError::ShardBounds {
                min: self.min_shards,
                max: self.max_shards,
            });
        }
        if self.min_backoff > self.max_backoff {
            return Err(ConfigError::BackoffBounds);
        }
        Ok(())
    }
}
