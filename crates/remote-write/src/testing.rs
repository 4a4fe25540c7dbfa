//! Test doubles for the consumed client and encoder seams.

use crate::config::QueueConfig;
use crate::datum::{KindCounts, MetricMetadata, PointKind, TimeSeriesEntry};
use crate::manager::SendContext;
use crate::sender::{AgeFilter, EncodedRequest, Error, RequestEncoder, WriteClient};
use async_trait::async_trait;
use bytes::Bytes;
use labels::LabelSet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted outcome of one `store` call. Unscripted calls succeed.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Outcome {
    Recoverable { retry_after_ms: Option<i64> },
    NonRecoverable,
    /// Never resolves, other than by cancellation.
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) struct StoreCall {
    pub payload: Bytes,
    pub attempt: u32,
    pub at: tokio::time::Instant,
    pub delivered: bool,
}

#[derive(Default)]
pub(crate) struct MockClient {
    calls: Mutex<Vec<StoreCall>>,
    script: Mutex<VecDeque<Outcome>>,
    delay: Mutex<Duration>,
}

impl MockClient {
    /// Queue outcomes for upcoming `store` calls, in order.
    pub fn script(&self, outcomes: Vec<Outcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    /// Stall every subsequent `store` call for `delay` before resolving.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_log(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn delivered_payloads(&self) -> Vec<Bytes> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.delivered)
            .map(|call| call.payload.clone())
            .collect()
    }

    /// Timestamps of every point in every delivered request, in delivery
    /// order, as encoded by [`MockEncoder`].
    pub fn sent_timestamps(&self) -> Vec<i64> {
        self.delivered_payloads()
            .iter()
            .flat_map(|payload| decode_timestamps(payload))
            .collect()
    }

    fn record(&self, payload: Bytes, attempt: u32, delivered: bool) {
        self.calls.lock().unwrap().push(StoreCall {
            payload,
            attempt,
            at: tokio::time::Instant::now(),
            delivered,
        });
    }
}

#[async_trait]
impl WriteClient for MockClient {
    async fn store(&self, payload: Bytes, attempt: u32) -> Result<(), Error> {
        let outcome = self.script.lock().unwrap().pop_front();

        if let Some(Outcome::Hang) = outcome {
            self.record(payload, attempt, false);
            return std::future::pending().await;
        }

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            None => {
                self.record(payload, attempt, true);
                Ok(())
            }
            Some(Outcome::Recoverable { retry_after_ms }) => {
                self.record(payload, attempt, false);
                Err(Error::Recoverable {
                    source: anyhow::anyhow!("scripted recoverable failure"),
                    retry_after_ms,
                })
            }
            Some(Outcome::NonRecoverable) => {
                self.record(payload, attempt, false);
                Err(Error::NonRecoverable(anyhow::anyhow!(
                    "scripted fatal failure"
                )))
            }
            Some(Outcome::Hang) => unreachable!("handled above"),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn endpoint(&self) -> &str {
        "http://mock.invalid/write"
    }
}

/// Encodes a request as the little-endian timestamps of its points (letting
/// tests assert delivery content and order) followed by the family names of
/// any metadata entries.
#[derive(Default)]
pub(crate) struct MockEncoder {
    seen_series: Mutex<Vec<LabelSet>>,
}

impl MockEncoder {
    /// Series label sets passed to `encode`, in order.
    pub fn seen_series(&self) -> Vec<LabelSet> {
        self.seen_series.lock().unwrap().clone()
    }
}

impl RequestEncoder for MockEncoder {
    fn encode(
        &self,
        series: &[TimeSeriesEntry],
        metadata: &[MetricMetadata],
        filter: Option<AgeFilter>,
    ) -> anyhow::Result<EncodedRequest> {
        let keep = |timestamp_ms: i64, kind: PointKind, dropped: &mut KindCounts| -> bool {
            match filter {
                Some(f) if timestamp_ms < f.min_timestamp_ms => {
                    dropped.bump(kind);
                    false
                }
                _ => true,
            }
        };

        let mut dropped = KindCounts::default();
        let mut timestamps = Vec::new();
        for entry in series {
            self.seen_series.lock().unwrap().push(entry.labels.clone());
            for point in &entry.samples {
                if keep(point.timestamp_ms, PointKind::Sample, &mut dropped) {
                    timestamps.push(point.timestamp_ms);
                }
            }
            for point in &entry.exemplars {
                if keep(point.timestamp_ms, PointKind::Exemplar, &mut dropped) {
                    timestamps.push(point.timestamp_ms);
                }
            }
            for point in &entry.histograms {
                if keep(point.timestamp_ms, PointKind::Histogram, &mut dropped) {
                    timestamps.push(point.timestamp_ms);
                }
            }
        }

        let mut payload = Vec::with_capacity(timestamps.len() * 8);
        for timestamp in &timestamps {
            payload.extend_from_slice(&timestamp.to_le_bytes());
        }
        for entry in metadata {
            payload.extend_from_slice(entry.family_name.as_bytes());
        }

        Ok(EncodedRequest {
            payload: payload.into(),
            highest_timestamp_ms: timestamps.iter().copied().max().unwrap_or(0),
            lowest_timestamp_ms: timestamps.iter().copied().min().unwrap_or(0),
            dropped,
        })
    }
}

pub(crate) fn decode_timestamps(payload: &[u8]) -> Vec<i64> {
    payload
        .chunks_exact(8)
        .map(|chunk| i64::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

/// A SendContext over fresh mocks, for exercising internals directly.
pub(crate) fn test_context(
    f: impl FnOnce(&mut QueueConfig),
) -> (Arc<SendContext>, Arc<MockClient>) {
    let mut cfg = QueueConfig::default();
    f(&mut cfg);
    let client = Arc::new(MockClient::default());
    let cx = Arc::new(SendContext::new(
        cfg,
        client.clone(),
        Arc::new(MockEncoder::default()),
    ));
    (cx, client)
}
