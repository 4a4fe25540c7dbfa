//! A remote-write queue manager: accepts a stream of time-series points
//! from an upstream producer, shards and batches them by series identity,
//! and ships them to a remote endpoint with bounded buffering, adaptive
//! parallelism, retry backoff, and bounded-loss shutdown.
//!
//! The network transport and the wire codec are consumed behind the
//! [`WriteClient`] and [`RequestEncoder`] seams.

pub mod config;
pub mod datum;

mod ewma;
mod manager;
mod queue;
mod rescale;
mod sender;
mod shards;
mod telemetry;
mod worker;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, QueueConfig};
pub use datum::{
    BucketSpan, Datum, ExemplarPoint, FloatHistogram, Histogram, HistogramPoint, HistogramValue,
    KindCounts, MetadataKind, MetricMetadata, Payload, PointKind, SamplePoint, TimeSeriesEntry,
};
pub use ewma::EwmaRate;
pub use manager::QueueManager;
pub use sender::{AgeFilter, EncodedRequest, Error, RequestEncoder, WriteClient};
