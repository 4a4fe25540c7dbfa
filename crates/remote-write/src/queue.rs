use crate::datum::Datum;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Per-shard buffering: a partial batch under a mutex, a bounded hand-off
/// channel of full batches, and a small pool of recycled batch buffers.
///
/// The shard worker owns the receiving half of the hand-off channel; the
/// queue owns the sending half until [`BatchQueue::flush_and_shutdown`]
/// drops it to signal completion.
pub(crate) struct BatchQueue {
    inner: Mutex<Inner>,
    // The pool takes its own finer lock: the append and reuse paths are
    // independent and must not contend on the batch mutex.
    pool: Mutex<Vec<Vec<Datum>>>,
    batch_size: usize,
    pool_capacity: usize,
}

struct Inner {
    batch: Vec<Datum>,
    tx: Option<mpsc::Sender<Vec<Datum>>>,
}

impl BatchQueue {
    /// Build a queue buffering up to `capacity` points in batches of
    /// `batch_size`, returning the worker's receiving half alongside.
    pub fn new(capacity: usize, batch_size: usize) -> (Self, mpsc::Receiver<Vec<Datum>>) {
        let chan_capacity = std::cmp::max(1, (capacity + batch_size - 1) / batch_size);
        let (tx, rx) = mpsc::channel(chan_capacity);
        let queue = Self {
            inner: Mutex::new(Inner {
                batch: Vec::with_capacity(batch_size),
                tx: Some(tx),
            }),
            pool: Mutex::new(Vec::new()),
            batch_size,
            pool_capacity: chan_capacity + 1,
        };
        (queue, rx)
    }

    /// Append one point to the partial batch. When the append fills the
    /// batch, attempt a non-blocking publish to the hand-off channel; if the
    /// channel cannot take it the append is undone and the point handed
    /// back, which the producer observes as backpressure.
    pub fn append(&self, datum: Datum) -> Result<(), Datum> {
        let mut inner = self.inner.lock().unwrap();
        let Inner { batch, tx } = &mut *inner;
        let Some(tx) = tx.as_ref() else {
            return Err(datum);
        };

        batch.push(datum);
        if batch.len() == self.batch_size {
            let full = std::mem::replace(batch, self.fresh_buffer());
            if let Err(err) = tx.try_send(full) {
                let (TrySendError::Full(mut full) | TrySendError::Closed(mut full)) = err;
                let datum = full.pop().expect("a full batch is never empty");
                let unused = std::mem::replace(batch, full);
                drop(inner);
                self.return_for_reuse(unused);
                return Err(datum);
            }
        }
        Ok(())
    }

    /// Swap out and return the current partial batch. The worker calls this
    /// on its flush-timer path after finding the hand-off channel empty.
    pub fn take_partial(&self) -> Vec<Datum> {
        let fresh = self.fresh_buffer();
        let mut inner = self.inner.lock().unwrap();
        std::mem::replace(&mut inner.batch, fresh)
    }

    /// Hand a spent batch buffer back for reuse. Points are dropped; the
    /// emptied buffer is pooled unless the pool is already full.
    pub fn return_for_reuse(&self, mut batch: Vec<Datum>) {
        batch.clear();
        let mut pool = self.pool.lock().unwrap();
        if pool.len() < self.pool_capacity {
            pool.push(batch);
        }
    }

    /// Publish the partial batch, retrying at one-second intervals while the
    /// hand-off channel is full, then close the channel. `done` aborts the
    /// retry loop once the workers have already exited and nobody will ever
    /// drain the channel again.
    pub async fn flush_and_shutdown(&self, done: CancellationToken) {
        while self.try_publish_partial(&done) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.batch = Vec::new();
        // Dropping the sender closes the hand-off channel; the worker exits
        // after draining what remains.
        inner.tx = None;
    }

    // True when the partial batch is non-empty and could not be published,
    // and the caller should sleep before retrying.
    fn try_publish_partial(&self, done: &CancellationToken) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Inner { batch, tx } = &mut *inner;
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        if batch.is_empty() || done.is_cancelled() {
            return false;
        }
        match tx.try_send(std::mem::take(batch)) {
            Ok(()) => false,
            Err(TrySendError::Full(b) | TrySendError::Closed(b)) => {
                *batch = b;
                true
            }
        }
    }

    fn fresh_buffer(&self) -> Vec<Datum> {
        let recycled = self.pool.lock().unwrap().pop();
        recycled.unwrap_or_else(|| Vec::with_capacity(self.batch_size))
    }
}
