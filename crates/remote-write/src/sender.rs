use crate::datum::{KindCounts, MetricMetadata, TimeSeriesEntry};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by the send path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Encoding a write request failed. Never retried: the batch is dropped
    /// and counted as failed.
    #[error("failed to encode write request")]
    Encode(#[source] anyhow::Error),
    /// A transport failure which may succeed if retried. `retry_after_ms` is
    /// the server-indicated minimum wait before the next attempt, when the
    /// response carried one; clients derive it from a Retry-After header,
    /// which can name a date in the past and so produce a negative value.
    #[error("recoverable error from remote endpoint")]
    Recoverable {
        #[source]
        source: anyhow::Error,
        retry_after_ms: Option<i64>,
    },
    /// A transport failure which retrying cannot fix.
    #[error(transparent)]
    NonRecoverable(anyhow::Error),
    /// The send was canceled by shutdown or reshard. Neither a success nor
    /// a failure: delivery counters must not claim either way.
    #[error("send canceled")]
    Canceled,
}

impl Error {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Recoverable { .. })
    }
}

/// A client which ships one opaque, encoded write request to the remote
/// endpoint.
#[async_trait]
pub trait WriteClient: Send + Sync + 'static {
    /// Deliver `payload`. `attempt` is zero on the first try of a request
    /// and increments with each retry of the same request.
    ///
    /// The returned future is dropped when a shutdown or reshard cancels
    /// the send, so implementations must be cancel-safe.
    async fn store(&self, payload: Bytes, attempt: u32) -> Result<(), Error>;

    /// Identity of this client, used to label telemetry.
    fn name(&self) -> &str;

    /// Remote endpoint URL, used to label telemetry.
    fn endpoint(&self) -> &str;
}

/// Cutoff applied while (re)encoding a request: points with a timestamp
/// strictly below `min_timestamp_ms` are omitted and reported as dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeFilter {
    pub min_timestamp_ms: i64,
}

/// The product of one request-encoder invocation.
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    /// Compressed wire payload, opaque to the queue.
    pub payload: Bytes,
    /// Highest and lowest point timestamps observed in the encoded request,
    /// in milliseconds. Zero when the request holds no points.
    pub highest_timestamp_ms: i64,
    pub lowest_timestamp_ms: i64,
    /// Points omitted by the age filter, by kind.
    pub dropped: KindCounts,
}

/// Encodes batches of series and/or metadata into wire payloads.
/// Implementations own the wire format and its framing compression.
pub trait RequestEncoder: Send + Sync + 'static {
    fn encode(
        &self,
        series: &[TimeSeriesEntry],
        metadata: &[MetricMetadata],
        filter: Option<AgeFilter>,
    ) -> anyhow::Result<EncodedRequest>;
}

/// One send operation driven by [`send_with_backoff`].
#[async_trait]
pub(crate) trait BackoffSend {
    async fn attempt(&mut self, attempt: u32) -> Result<(), Error>;

    /// Invoked after each failed attempt has finished waiting, immediately
    /// before the next one.
    fn on_retry(&mut self) {}
}

/// Drive `op` until it succeeds, fails non-recoverably, or `cancel` fires.
///
/// Retries are unbounded: while the remote keeps failing recoverably the
/// caller stays blocked here, which is what propagates backpressure up to
/// producers. A positive server retry-after hint overrides the computed
/// sleep (uncapped for that sleep; the following doubling step re-clamps),
/// and a negative hint is ignored.
pub(crate) async fn send_with_backoff(
    min_backoff: Duration,
    max_backoff: Duration,
    cancel: &CancellationToken,
    op: &mut (dyn BackoffSend + Send),
) -> Result<(), Error> {
    let mut backoff = min_backoff;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let err = match op.attempt(attempt).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let retry_after_ms = match &err {
            Error::Recoverable { retry_after_ms, .. } => *retry_after_ms,
            _ => return Err(err),
        };

        let mut sleep = backoff;
        match retry_after_ms {
            Some(ms) if ms > 0 => sleep = Duration::from_millis(ms as u64),
            Some(ms) if ms < 0 => {
                tracing::debug!(
                    retry_after_ms = ms,
                    "ignoring retry-after hint in the past"
                );
            }
            _ => {}
        }
        tracing::warn!(attempt, sleep_ms = sleep.as_millis() as u64, ?err, "failed to send batch, retrying");

        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(sleep) => {}
        }

        op.on_retry();
        backoff = std::cmp::min(sleep * 2, max_backoff);
        attempt += 1;
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    /// Scripts one outcome per attempt and records when each attempt ran.
    struct ScriptedOp {
        outcomes: Vec<Result<(), Error>>,
        attempts: Vec<(u32, Instant)>,
        retries: usize,
    }

    impl ScriptedOp {
        fn new(outcomes: Vec<Result<(), Error>>) -> Self {
            Self {
                outcomes,
                attempts: Vec::new(),
                retries: 0,
            }
        }
    }

    #[async_trait]
    impl BackoffSend for ScriptedOp {
        async fn attempt(&mut self, attempt: u32) -> Result<(), Error> {
            self.attempts.push((attempt, Instant::now()));
            if self.outcomes.is_empty() {
                Ok(())
            } else {
                self.outcomes.remove(0)
            }
        }

        fn on_retry(&mut self) {
            self.retries += 1;
        }
    }

    fn recoverable(retry_after_ms: Option<i64>) -> Error {
        Error::Recoverable {
            source: anyhow::anyhow!("scripted"),
            retry_after_ms,
        }
    }

    fn gaps(op: &ScriptedOp) -> Vec<Duration> {
        op.attempts
            .windows(2)
            .map(|w| w[1].1 - w[0].1)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_without_retry() {
        let cancel = CancellationToken::new();
        let mut op = ScriptedOp::new(vec![]);
        send_with_backoff(
            Duration::from_millis(10),
            Duration::from_millis(80),
            &cancel,
            &mut op,
        )
        .await
        .unwrap();
        assert_eq!(op.attempts.len(), 1);
        assert_eq!(op.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_clamps() {
        let cancel = CancellationToken::new();
        let mut op = ScriptedOp::new(vec![
            Err(recoverable(None)),
            Err(recoverable(None)),
            Err(recoverable(None)),
            Err(recoverable(None)),
            Ok(()),
        ]);
        send_with_backoff(
            Duration::from_millis(10),
            Duration::from_millis(40),
            &cancel,
            &mut op,
        )
        .await
        .unwrap();

        assert_eq!(
            op.attempts.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(
            gaps(&op),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(40),
            ]
        );
        assert_eq!(op.retries, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_sleep() {
        let cancel = CancellationToken::new();
        // The hint exceeds max_backoff; it still governs this sleep, and the
        // next doubling step re-clamps.
        let mut op = ScriptedOp::new(vec![
            Err(recoverable(Some(500))),
            Err(recoverable(None)),
            Ok(()),
        ]);
        send_with_backoff(
            Duration::from_millis(10),
            Duration::from_millis(100),
            &cancel,
            &mut op,
        )
        .await
        .unwrap();

        assert_eq!(
            gaps(&op),
            vec![Duration::from_millis(500), Duration::from_millis(100)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_retry_after_is_ignored() {
        let cancel = CancellationToken::new();
        let mut op = ScriptedOp::new(vec![Err(recoverable(Some(-250))), Ok(())]);
        send_with_backoff(
            Duration::from_millis(10),
            Duration::from_millis(100),
            &cancel,
            &mut op,
        )
        .await
        .unwrap();
        assert_eq!(gaps(&op), vec![Duration::from_millis(10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_recoverable_exits_immediately() {
        let cancel = CancellationToken::new();
        let mut op = ScriptedOp::new(vec![Err(Error::NonRecoverable(anyhow::anyhow!("boom")))]);
        let err = send_with_backoff(
            Duration::from_millis(10),
            Duration::from_millis(100),
            &cancel,
            &mut op,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NonRecoverable(_)));
        assert_eq!(op.attempts.len(), 1);
        assert_eq!(op.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_breaks_the_loop() {
        let cancel = CancellationToken::new();
        // Every attempt fails recoverably; cancellation is the only way out.
        let mut op = ScriptedOp::new((0..64).map(|_| Err(recoverable(None))).collect());

        let canceler = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            canceler.cancel();
        });

        let err = send_with_backoff(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            &cancel,
            &mut op,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Canceled));
        assert_eq!(op.attempts.len(), 1);
    }
}
