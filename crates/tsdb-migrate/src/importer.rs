//! Batching importer: a bounded queue drained by a fixed pool of writers.
//!
//! Extraction workers [`submit`](ImportQueue::submit) series into a bounded
//! channel and are suspended once it is full. Queue entries hold at most
//! `batch_size` points, so the queue never buffers more than
//! `queue_capacity * batch_size` points. Exactly `concurrency` import
//! workers share the receiving end; each accumulates its own [`Batch`] and
//! flushes it when full, when idle for `flush_interval`, or on close. The
//! worker count is therefore the cap on concurrent writes to the target.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::TimeSeries;
use crate::retry::{with_retry, RetryConfig};
use crate::stats::RunStats;
use crate::target::{Batch, TargetWriter};

/// Importer settings, fixed for a run.
#[derive(Debug, Clone)]
pub struct ImporterConfig {
    /// Number of import workers (and concurrent writes).
    pub concurrency: usize,
    /// Points per batch.
    pub batch_size: usize,
    /// Queue entries (each at most `batch_size` points) held before
    /// submitters are suspended.
    pub queue_capacity: usize,
    /// Flush a partial batch after this long without new data.
    pub flush_interval: Option<Duration>,
    /// Retry policy for failed writes.
    pub retry: RetryConfig,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            batch_size: 200_000,
            queue_capacity: 8,
            flush_interval: Some(Duration::from_secs(5)),
            retry: RetryConfig::default(),
        }
    }
}

impl ImporterConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("import concurrency must be greater than 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be greater than 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be greater than 0".to_string()));
        }
        Ok(())
    }
}

/// Cloneable submission handle onto the importer's queue.
#[derive(Debug, Clone)]
pub struct ImportQueue {
    tx: mpsc::Sender<TimeSeries>,
    max_points: usize,
}

impl ImportQueue {
    /// Queues a series for import, waiting while the queue is full.
    ///
    /// Series longer than the batch size are queued in batch-sized pieces,
    /// in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImporterClosed`] once every import worker has stopped.
    pub async fn submit(&self, mut series: TimeSeries) -> Result<()> {
        while !series.is_empty() {
            let rest = (series.len() > self.max_points)
                .then(|| series.split_off(self.max_points));
            self.tx
                .send(series)
                .await
                .map_err(|_| Error::ImporterClosed)?;
            match rest {
                Some(rest) => series = rest,
                None => break,
            }
        }
        Ok(())
    }

    /// Queue entries currently waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Owns the import worker pool.
pub struct Importer {
    queue: ImportQueue,
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    stats: Arc<RunStats>,
}

impl Importer {
    /// Checks the target and starts the worker pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the target cannot
    /// be reached.
    pub async fn open(
        config: ImporterConfig,
        writer: Arc<dyn TargetWriter>,
        stats: Arc<RunStats>,
    ) -> Result<Self> {
        config.validate()?;
        writer.ping().await?;
        info!(
            "Connected to {} target, {} import workers, batch size {}",
            writer.target_type(),
            config.concurrency,
            config.batch_size
        );
        Self::new(config, writer, stats)
    }

    /// Starts the worker pool without checking the target.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: ImporterConfig,
        writer: Arc<dyn TargetWriter>,
        stats: Arc<RunStats>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let config = Arc::new(config);

        let workers = (0..config.concurrency)
            .map(|id| {
                let worker = ImportWorker {
                    id,
                    rx: rx.clone(),
                    writer: writer.clone(),
                    stats: stats.clone(),
                    config: config.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Ok(Self {
            queue: ImportQueue {
                tx,
                max_points: config.batch_size,
            },
            workers,
            shutdown,
            stats,
        })
    }

    /// A submission handle for extraction workers.
    #[must_use]
    pub fn queue(&self) -> ImportQueue {
        self.queue.clone()
    }

    /// Queues a series for import. See [`ImportQueue::submit`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImporterClosed`] once every import worker has stopped.
    pub async fn submit(&self, series: TimeSeries) -> Result<()> {
        self.queue.submit(series).await
    }

    /// Queue entries currently waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Token that makes workers stop before their next flush when cancelled.
    #[must_use]
    pub fn abort_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops workers before their next flush. Buffered points are dropped
    /// and reported as failed; a write already in flight completes.
    pub fn abort(&self) {
        self.shutdown.cancel();
    }

    /// Waits for everything submitted so far to be flushed.
    ///
    /// Completes once every [`ImportQueue`] clone has been dropped and the
    /// queue is drained.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Import`] if any batch could not be written.
    pub async fn close(self) -> Result<()> {
        let Self {
            queue,
            workers,
            stats,
            ..
        } = self;
        drop(queue);

        for handle in workers {
            if let Err(e) = handle.await {
                error!("Import worker terminated abnormally: {}", e);
            }
        }

        match stats.batches_failed() {
            0 => Ok(()),
            failed => Err(Error::Import {
                failed,
                last: stats.last_error().unwrap_or_default(),
            }),
        }
    }
}

struct ImportWorker {
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<TimeSeries>>>,
    writer: Arc<dyn TargetWriter>,
    stats: Arc<RunStats>,
    config: Arc<ImporterConfig>,
    shutdown: CancellationToken,
}

impl ImportWorker {
    async fn run(self) {
        let mut batch = Batch::new(self.config.batch_size);

        loop {
            let next = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = idle(self.config.flush_interval), if !batch.is_empty() => {
                    debug!("Import worker {}: idle flush of {} points", self.id, batch.len());
                    self.flush(&mut batch).await;
                    continue;
                }
                next = recv(&self.rx) => next,
            };

            // Queue closed and drained
            let Some(series) = next else { break };

            let mut pending = Some(series);
            while let Some(series) = pending.take() {
                pending = batch.push(series);
                if batch.is_full() {
                    self.flush(&mut batch).await;
                }
            }
        }

        self.flush(&mut batch).await;
        debug!("Import worker {} stopped", self.id);
    }

    async fn flush(&self, batch: &mut Batch) {
        if batch.is_empty() {
            return;
        }
        let points = batch.len() as u64;

        if self.shutdown.is_cancelled() {
            warn!("Import aborted, dropping batch of {} points", points);
            self.stats.record_batch_failed(points, &Error::Cancelled);
            batch.clear();
            return;
        }

        let ready: &Batch = batch;
        let result = with_retry(&self.config.retry, &self.shutdown, "import batch", || {
            self.writer.write(ready)
        })
        .await;

        match result {
            Ok(()) => self.stats.record_batch_written(points),
            Err(e) if e.is_fatal() => {
                error!("Target rejected the run: {}", e);
                self.stats.record_batch_failed(points, &e);
                self.stats.record_fatal(e);
                self.shutdown.cancel();
            }
            Err(e) => {
                error!("Failed to import batch of {} points: {}", points, e);
                self.stats.record_batch_failed(points, &e);
            }
        }
        batch.clear();
    }
}

async fn recv(rx: &Mutex<mpsc::Receiver<TimeSeries>>) -> Option<TimeSeries> {
    rx.lock().await.recv().await
}

async fn idle(interval: Option<Duration>) {
    match interval {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "importer_tests.rs"]
mod tests;
