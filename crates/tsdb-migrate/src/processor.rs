//! Migration run orchestration.
//!
//! A [`Processor`] drives one run: it connects the source, explores it for
//! read tasks, opens the importer, and lets `concurrency` extraction workers
//! pull tasks on demand. Each worker streams the chunks of its task through
//! the transformer into the importer queue.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MigrationConfig, SourceConfig};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::importer::{ImportQueue, Importer, ImporterConfig};
use crate::sources::{InfluxReader, PrometheusReader, SourceReader};
use crate::stats::{RunStats, RunSummary};
use crate::target::{create_writer, TargetWriter};
use crate::transform::Transformer;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not started.
    Idle,
    /// Workers are extracting and importing.
    Running,
    /// Every task was processed and the importer drained.
    Completed,
    /// Stopped by the cancellation token.
    Cancelled,
    /// Aborted by an unrecoverable error.
    FailedFatal,
}

/// How a run that did not fail fatally ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Everything was migrated.
    Completed,
    /// The run finished but some chunks or batches failed.
    CompletedWithErrors,
    /// The run was cancelled; the summary is partial.
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::CompletedWithErrors => write!(f, "completed with errors"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a run that reached a non-fatal terminal state.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Terminal outcome.
    pub outcome: RunOutcome,
    /// Final counters.
    pub summary: RunSummary,
}

/// Extraction-side settings.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Number of extraction workers.
    pub concurrency: usize,
    /// How long cancellation waits for workers and for the final flush.
    pub grace_period: Duration,
    /// Hide the progress bar.
    pub silent: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            grace_period: Duration::from_secs(5),
            silent: false,
        }
    }
}

/// Drives one migration run from a source reader into a target writer.
pub struct Processor<R: SourceReader> {
    reader: Option<R>,
    filter: Arc<Filter>,
    transformer: Arc<Transformer>,
    importer_config: ImporterConfig,
    writer: Arc<dyn TargetWriter>,
    options: ProcessorOptions,
    state: RunState,
}

impl<R: SourceReader> Processor<R> {
    /// Creates an idle processor.
    pub fn new(
        reader: R,
        filter: Filter,
        transformer: Transformer,
        importer_config: ImporterConfig,
        writer: Arc<dyn TargetWriter>,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            reader: Some(reader),
            filter: Arc::new(filter),
            transformer: Arc::new(transformer),
            importer_config,
            writer,
            options,
            state: RunState::Idle,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Runs the migration until completion, cancellation or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns the fatal error when the run ends in [`RunState::FailedFatal`]:
    /// an invalid filter, an unreachable or unauthenticated source or target.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunReport> {
        if self.state != RunState::Idle {
            return Err(Error::Config("a processor runs only once".to_string()));
        }
        self.state = RunState::Running;

        match self.execute(cancel).await {
            Ok(report) => {
                self.state = match report.outcome {
                    RunOutcome::Cancelled => RunState::Cancelled,
                    _ => RunState::Completed,
                };
                info!(
                    "Migration {}: {} points written, {} failed, {} chunk errors in {:.2}s ({:.0} pts/sec)",
                    report.outcome,
                    report.summary.points_written,
                    report.summary.points_failed,
                    report.summary.chunk_errors,
                    report.summary.duration.as_secs_f64(),
                    report.summary.throughput()
                );
                Ok(report)
            }
            Err(e) => {
                error!("Migration failed: {}", e);
                self.state = RunState::FailedFatal;
                Err(e)
            }
        }
    }

    #[allow(clippy::cognitive_complexity)] // Reason: the run is a fixed sequence of phases
    async fn execute(&mut self, cancel: CancellationToken) -> Result<RunReport> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| Error::Config("source reader already consumed".to_string()))?;

        self.filter.validate()?;
        reader.connect().await?;
        info!("Connected to {} source", reader.source_type());

        let tasks: Arc<[R::Task]> = reader.explore(&self.filter).await?.into();
        let stats = Arc::new(RunStats::new());
        stats.set_tasks_total(tasks.len() as u64);

        let importer =
            Importer::open(self.importer_config.clone(), self.writer.clone(), stats.clone())
                .await?;

        let progress = create_progress_bar(tasks.len() as u64, self.options.silent);
        let reader = Arc::new(reader);
        let stop = cancel.child_token();
        let cursor = Arc::new(AtomicUsize::new(0));

        let workers = self.options.concurrency.max(1).min(tasks.len().max(1));
        info!(
            "Processing {} tasks with {} extraction workers",
            tasks.len(),
            workers
        );

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let worker = ExtractionWorker {
                    id,
                    reader: reader.clone(),
                    tasks: tasks.clone(),
                    cursor: cursor.clone(),
                    filter: self.filter.clone(),
                    transformer: self.transformer.clone(),
                    queue: importer.queue(),
                    stats: stats.clone(),
                    stop: stop.clone(),
                    progress: progress.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let grace = self.options.grace_period;
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let mut all = Box::pin(futures::future::join_all(handles));

        let interrupted = tokio::select! {
            results = &mut all => {
                log_panics(results);
                false
            }
            () = cancel.cancelled() => true,
        };

        if interrupted {
            info!("Cancellation requested, finishing in-flight chunks");
            match tokio::time::timeout(grace, &mut all).await {
                Ok(results) => log_panics(results),
                Err(_) => {
                    warn!("Extraction workers did not stop within {:?}, aborting", grace);
                    for handle in &aborts {
                        handle.abort();
                    }
                    let _ = all.await;
                }
            }
        }

        let abort_import = importer.abort_token();
        let mut close = std::pin::pin!(importer.close());
        let mut interrupted = interrupted;
        let mut closed = None;
        if !interrupted {
            tokio::select! {
                result = close.as_mut() => closed = Some(result),
                () = cancel.cancelled() => interrupted = true,
            }
        }
        if closed.is_none() {
            closed = match tokio::time::timeout(grace, close.as_mut()).await {
                Ok(result) => Some(result),
                Err(_) => {
                    warn!("Flush did not finish within {:?}, dropping buffered batches", grace);
                    abort_import.cancel();
                    tokio::time::timeout(grace, close.as_mut()).await.ok()
                }
            };
        }
        match closed {
            Some(Ok(())) => {}
            Some(Err(e)) => warn!("{}", e),
            None => warn!("Import workers still busy, giving up"),
        }

        progress.finish_and_clear();

        if let Ok(mut reader) = Arc::try_unwrap(reader) {
            if let Err(e) = reader.close().await {
                warn!("Failed to close source: {}", e);
            }
        }

        if let Some(fatal) = stats.take_fatal() {
            return Err(fatal);
        }

        let summary = stats.snapshot();
        let outcome = if interrupted {
            RunOutcome::Cancelled
        } else if summary.has_errors() {
            RunOutcome::CompletedWithErrors
        } else {
            RunOutcome::Completed
        };
        Ok(RunReport { outcome, summary })
    }
}

/// Builds the reader, writer and processor a configuration describes and
/// runs it.
///
/// # Errors
///
/// Returns an error for an invalid configuration or a fatal run failure.
pub async fn run_migration(config: &MigrationConfig, cancel: CancellationToken) -> Result<RunReport> {
    config.validate()?;
    let writer = create_writer(&config.target, config.options.dry_run);
    let transformer = Transformer::new(config.options.transform_config());
    let importer = config.options.importer_config();
    let options = config.options.processor_options();
    let filter = config.filter.clone();

    match &config.source {
        SourceConfig::Influx(influx) => {
            let reader = InfluxReader::new(influx.clone());
            Processor::new(reader, filter, transformer, importer, writer, options)
                .run(cancel)
                .await
        }
        SourceConfig::Prometheus(prom) => {
            let reader = PrometheusReader::new(prom.clone());
            Processor::new(reader, filter, transformer, importer, writer, options)
                .run(cancel)
                .await
        }
    }
}

fn log_panics(results: Vec<std::result::Result<(), tokio::task::JoinError>>) {
    for result in results {
        if let Err(e) = result {
            if e.is_panic() {
                error!("Extraction worker panicked: {}", e);
            }
        }
    }
}

struct ExtractionWorker<R: SourceReader> {
    id: usize,
    reader: Arc<R>,
    tasks: Arc<[R::Task]>,
    cursor: Arc<AtomicUsize>,
    filter: Arc<Filter>,
    transformer: Arc<Transformer>,
    queue: ImportQueue,
    stats: Arc<RunStats>,
    stop: CancellationToken,
    progress: ProgressBar,
}

impl<R: SourceReader> ExtractionWorker<R> {
    async fn run(self) {
        loop {
            if self.should_stop() {
                break;
            }
            let Some(task) = self.tasks.get(self.cursor.fetch_add(1, Ordering::Relaxed)) else {
                break;
            };

            debug!("Worker {} reading {}", self.id, task);
            let result = self.process(task).await;
            self.stats.record_task_done();
            self.progress.inc(1);

            match result {
                Ok(()) => {}
                Err(Error::ImporterClosed) => {
                    debug!("Worker {}: importer closed", self.id);
                    break;
                }
                Err(e) if e.is_fatal() => {
                    self.stats.record_fatal(e);
                    self.stop.cancel();
                    break;
                }
                Err(e) => {
                    warn!("Skipping {}: {}", task, e);
                    self.stats.record_chunk_error(&e);
                }
            }
        }
        debug!("Extraction worker {} stopped", self.id);
    }

    fn should_stop(&self) -> bool {
        if self.stats.has_fatal() {
            self.stop.cancel();
        }
        self.stop.is_cancelled()
    }

    /// Streams one task into the importer.
    ///
    /// Chunk errors are recorded here; the returned error is either run-fatal,
    /// a closed importer, or a failure to open the task.
    async fn process(&self, task: &R::Task) -> Result<()> {
        let mut chunks = self.reader.read(task, &self.filter).await?;

        loop {
            if self.should_stop() {
                return Ok(());
            }
            let next = tokio::select! {
                biased;
                () = self.stop.cancelled() => return Ok(()),
                next = chunks.next() => next,
            };
            let Some(item) = next else {
                return Ok(());
            };

            match item {
                Ok(chunk) => {
                    let mut points = 0u64;
                    for series in self.transformer.transform(&chunk) {
                        points += series.len() as u64;
                        self.queue.submit(series).await?;
                    }
                    self.stats.record_chunk(points);
                    self.progress
                        .set_message(format!("{} chunks", self.stats.chunks_read()));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Chunk of {} failed: {}", task, e);
                    self.stats.record_chunk_error(&e);
                }
            }
        }
    }
}

fn create_progress_bar(total: u64, silent: bool) -> ProgressBar {
    if silent {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tasks, {msg} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
