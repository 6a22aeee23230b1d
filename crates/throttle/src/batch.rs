//! Item batching
//!
//! Callers submit single items with `add_item` and await their own outcome.
//! Items collect in an open batch that is handed to the processor as soon
//! as it reaches `batch_size`, or after at most `batch_timeout` otherwise.
//! The processor runs one processing call per batch, in FIFO order, and
//! resolves items positionally as outcomes stream back.
//!
//! An error from the processing stream fails the item it lands on and every
//! later item of the same batch with that same error. Earlier items keep
//! their results and later batches are unaffected. Nothing is retried.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BatchError, Error, Result};
use crate::rate_limiter::RateLimiter;

type Outcome<R, E> = std::result::Result<R, BatchError<E>>;

type ProcessFn<T, R, E> =
    Arc<dyn Fn(Vec<T>) -> BoxStream<'static, std::result::Result<R, E>> + Send + Sync>;

struct BatchItem<T, R, E> {
    sequence_id: u64,
    payload: T,
    result: oneshot::Sender<Outcome<R, E>>,
}

struct Queue<T, R, E> {
    open: Vec<BatchItem<T, R, E>>,
    pending: VecDeque<Vec<BatchItem<T, R, E>>>,
    next_sequence_id: u64,
}

struct Inner<T, R, E> {
    batch_size: usize,
    batch_timeout: Duration,
    process: ProcessFn<T, R, E>,
    admission: Option<Arc<RateLimiter>>,
    queue: Mutex<Queue<T, R, E>>,
    signal: Notify,
    closed: AtomicBool,
    processor: Mutex<Option<JoinHandle<()>>>,
}

/// Groups individually submitted items into batches.
///
/// `T` is the item payload, `R` the per-item result and `E` the processing
/// error. The processing function receives the payloads of one batch in
/// submission order and must yield exactly one outcome per payload, in the
/// same order.
pub struct BatchCoordinator<T, R, E> {
    inner: Arc<Inner<T, R, E>>,
}

impl<T, R, E> BatchCoordinator<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: std::fmt::Display + Send + Sync + 'static,
{
    pub fn new<F, S>(batch_size: usize, batch_timeout: Duration, process: F) -> Result<Self>
    where
        F: Fn(Vec<T>) -> S + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<R, E>> + Send + 'static,
    {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".into()));
        }
        if batch_timeout.is_zero() {
            return Err(Error::InvalidConfig("batch_timeout must be positive".into()));
        }
        let process: ProcessFn<T, R, E> = Arc::new(move |payloads| process(payloads).boxed());
        Ok(Self {
            inner: Arc::new(Inner {
                batch_size,
                batch_timeout,
                process,
                admission: None,
                queue: Mutex::new(Queue {
                    open: Vec::new(),
                    pending: VecDeque::new(),
                    next_sequence_id: 0,
                }),
                signal: Notify::new(),
                closed: AtomicBool::new(false),
                processor: Mutex::new(None),
            }),
        })
    }

    /// Gate every batch on one admission from `limiter`.
    ///
    /// Fails with `InvalidConfig` once the processor has started, i.e.
    /// after the first `add_item`.
    pub fn with_admission(mut self, limiter: Arc<RateLimiter>) -> Result<Self> {
        let Some(inner) = Arc::get_mut(&mut self.inner) else {
            return Err(Error::InvalidConfig(
                "admission limiter must be set before the first item".into(),
            ));
        };
        inner.admission = Some(limiter);
        Ok(self)
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    pub fn batch_timeout(&self) -> Duration {
        self.inner.batch_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Submit one item and wait for its outcome.
    pub async fn add_item(&self, payload: T) -> Outcome<R, E> {
        if self.is_closed() {
            return Err(BatchError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.inner.queue.lock().await;
            if self.is_closed() {
                return Err(BatchError::Closed);
            }
            let sequence_id = queue.next_sequence_id;
            queue.next_sequence_id += 1;
            queue.open.push(BatchItem {
                sequence_id,
                payload,
                result: tx,
            });
            if queue.open.len() >= self.inner.batch_size {
                let full = std::mem::take(&mut queue.open);
                queue.pending.push_back(full);
                self.inner.signal.notify_one();
            }
        }

        self.ensure_processor().await;

        // A dropped sender means the processor was aborted during close.
        rx.await.unwrap_or(Err(BatchError::Closed))
    }

    async fn ensure_processor(&self) {
        let mut processor = self.inner.processor.lock().await;
        if self.is_closed() {
            return;
        }
        let running = processor.as_ref().is_some_and(|h| !h.is_finished());
        if !running {
            debug!(batch_size = self.inner.batch_size, "starting batch processor");
            *processor = Some(tokio::spawn(Inner::run(Arc::clone(&self.inner))));
        }
    }

    /// Stop accepting items and drain.
    ///
    /// Waits up to `batch_timeout` for the processor to finish queued
    /// batches, then aborts it. Items still unresolved at that point get
    /// `BatchError::Closed`. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.signal.notify_one();

        let handle = self.inner.processor.lock().await.take();
        if let Some(mut handle) = handle
            && tokio::time::timeout(self.inner.batch_timeout, &mut handle)
                .await
                .is_err()
        {
            warn!(
                timeout_ms = self.inner.batch_timeout.as_millis() as u64,
                "batch processor did not drain in time, aborting"
            );
            handle.abort();
            let _ = handle.await;
        }

        let mut queue = self.inner.queue.lock().await;
        let open = std::mem::take(&mut queue.open);
        let leftovers: Vec<_> = queue.pending.drain(..).flatten().chain(open).collect();
        if !leftovers.is_empty() {
            warn!(items = leftovers.len(), "resolving unprocessed items as closed");
        }
        for item in leftovers {
            let _ = item.result.send(Err(BatchError::Closed));
        }
        info!("batch coordinator closed");
    }
}

impl<T, R, E> Drop for BatchCoordinator<T, R, E> {
    fn drop(&mut self) {
        if let Ok(mut processor) = self.inner.processor.try_lock()
            && let Some(handle) = processor.take()
        {
            handle.abort();
        }
    }
}

impl<T, R, E> Inner<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: std::fmt::Display + Send + Sync + 'static,
{
    async fn run(self: Arc<Self>) {
        loop {
            let batches: Vec<_> = {
                let mut queue = self.queue.lock().await;
                if !queue.open.is_empty() {
                    let open = std::mem::take(&mut queue.open);
                    queue.pending.push_back(open);
                }
                if queue.pending.is_empty() && self.closed.load(Ordering::Acquire) {
                    break;
                }
                queue.pending.drain(..).collect()
            };

            if batches.is_empty() {
                let _ = tokio::time::timeout(self.batch_timeout, self.signal.notified()).await;
                continue;
            }

            for batch in batches {
                self.dispatch(batch).await;
            }
        }
        debug!("batch processor stopped");
    }

    async fn dispatch(&self, batch: Vec<BatchItem<T, R, E>>) {
        if batch.is_empty() {
            return;
        }
        let first_id = batch[0].sequence_id;

        if let Some(limiter) = &self.admission
            && let Err(e) = limiter.wait_for_token(None).await
        {
            warn!(first_id, error = %e, "batch admission failed");
            let err = BatchError::Admission(e.to_string());
            for item in batch {
                let _ = item.result.send(Err(err.clone()));
            }
            return;
        }

        let size = batch.len();
        metrics::counter!("batch_flushes_total").increment(1);
        metrics::histogram!("batch_size").record(size as f64);
        debug!(first_id, size, "processing batch");

        let (payloads, senders): (Vec<T>, Vec<_>) = batch
            .into_iter()
            .map(|item| (item.payload, item.result))
            .unzip();

        let mut outcomes = (self.process)(payloads);
        let mut senders = senders.into_iter();
        while let Some(sender) = senders.next() {
            let failure = match outcomes.next().await {
                Some(Ok(value)) => {
                    let _ = sender.send(Ok(value));
                    continue;
                }
                Some(Err(e)) => BatchError::ItemFailed(Arc::new(e)),
                None => BatchError::MissingOutcome,
            };

            let failed = 1 + senders.len();
            metrics::counter!("batch_item_failures_total").increment(failed as u64);
            warn!(first_id, size, failed, error = %failure, "batch failed");

            let _ = sender.send(Err(failure.clone()));
            for sender in senders.by_ref() {
                let _ = sender.send(Err(failure.clone()));
            }
        }
    }
}
