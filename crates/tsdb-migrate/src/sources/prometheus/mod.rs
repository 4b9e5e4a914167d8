//! Prometheus snapshot reader.
//!
//! A snapshot is a directory of persisted TSDB blocks. Each block
//! (`<ulid>/meta.json`, `index`, `chunks/`) is one read task; reading a
//! block walks every series in its index and decodes the chunks that
//! overlap the time filter.

mod chunks;
mod index;
mod xor;

#[cfg(test)]
pub(crate) mod testutil;

pub use chunks::{ChunkReader, RawChunk, ENCODING_XOR};
pub use index::{ChunkMeta, IndexReader, SeriesEntry};
pub use xor::XorIterator;

use async_trait::async_trait;
use futures::stream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::model::{Chunk, Label};
use crate::sources::{ChunkStream, SourceReader};
use crate::transform::METRIC_NAME_LABEL;

/// Bit pattern Prometheus writes to mark a series as stale.
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// Malformed on-disk data.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Corruption(String);

impl Corruption {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Configuration for the Prometheus snapshot source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Path to the snapshot directory.
    pub snapshot: PathBuf,
}

/// Block statistics from `meta.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    /// Samples in the block.
    #[serde(default)]
    pub num_samples: u64,
    /// Series in the block.
    #[serde(default)]
    pub num_series: u64,
    /// Chunks in the block.
    #[serde(default)]
    pub num_chunks: u64,
}

/// Contents of a block's `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    /// Block identifier.
    pub ulid: String,
    /// Inclusive minimum timestamp.
    pub min_time: i64,
    /// Exclusive maximum timestamp.
    pub max_time: i64,
    /// Block statistics.
    #[serde(default)]
    pub stats: BlockStats,
    /// Meta format version.
    #[serde(default)]
    pub version: u32,
}

impl BlockMeta {
    /// Reads `meta.json` from a block directory.
    pub fn read(dir: &Path) -> std::result::Result<Self, Corruption> {
        let path = dir.join("meta.json");
        let raw = fs::read(&path)
            .map_err(|e| Corruption::new(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Corruption::new(format!("invalid {}: {}", path.display(), e)))
    }
}

/// A block of the snapshot to migrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTask {
    /// Block directory.
    pub dir: PathBuf,
    /// Parsed `meta.json`.
    pub meta: BlockMeta,
}

impl fmt::Display for BlockTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}", self.meta.ulid)
    }
}

/// An opened block.
pub struct Block {
    meta: BlockMeta,
    index: IndexReader,
    chunks: ChunkReader,
}

impl Block {
    /// Opens the index and chunk segments of a block directory.
    pub fn open(dir: &Path) -> std::result::Result<Self, Corruption> {
        Ok(Self {
            meta: BlockMeta::read(dir)?,
            index: IndexReader::open(&dir.join("index"))?,
            chunks: ChunkReader::open(&dir.join("chunks"))?,
        })
    }

    /// Block metadata.
    #[must_use]
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// Decodes the samples of `series` within `[start, end]`.
    ///
    /// Stale markers are dropped.
    pub fn samples(
        &self,
        series: &SeriesEntry,
        start: i64,
        end: i64,
    ) -> std::result::Result<(Vec<i64>, Vec<f64>), Corruption> {
        let mut timestamps = Vec::new();
        let mut values = Vec::new();

        for meta in &series.chunks {
            if meta.max_time < start || meta.min_time > end {
                continue;
            }
            let raw = self.chunks.chunk(meta.reference)?;
            if raw.encoding != ENCODING_XOR {
                return Err(Corruption::new(format!(
                    "unsupported chunk encoding {}",
                    raw.encoding
                )));
            }
            for sample in XorIterator::new(raw.data)? {
                let (t, v) = sample?;
                if t < start || t > end || v.to_bits() == STALE_NAN_BITS {
                    continue;
                }
                timestamps.push(t);
                values.push(v);
            }
        }

        Ok((timestamps, values))
    }
}

/// Label filter: the named label's value must fully match the regex.
/// An absent label matches as the empty string.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    name: String,
    regex: Regex,
}

impl LabelMatcher {
    /// Builds the matcher described by a filter, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFilter`] for an invalid regular expression.
    pub fn from_filter(filter: &Filter) -> Result<Option<Self>> {
        let Some(name) = &filter.label else {
            return Ok(None);
        };
        let pattern = filter.label_value.as_deref().unwrap_or(".*");
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            Error::InvalidFilter(format!("invalid label value regex '{}': {}", pattern, e))
        })?;
        Ok(Some(Self {
            name: name.clone(),
            regex,
        }))
    }

    /// Whether a series' labels pass the matcher.
    #[must_use]
    pub fn matches(&self, labels: &[(String, String)]) -> bool {
        let value = labels
            .iter()
            .find(|(name, _)| *name == self.name)
            .map_or("", |(_, value)| value.as_str());
        self.regex.is_match(value)
    }
}

/// Prometheus snapshot reader.
pub struct PrometheusReader {
    config: PrometheusConfig,
    blocks: Vec<BlockTask>,
}

impl PrometheusReader {
    /// Creates a reader for a snapshot directory.
    pub fn new(config: PrometheusConfig) -> Self {
        Self {
            config,
            blocks: Vec::new(),
        }
    }
}

#[async_trait]
impl SourceReader for PrometheusReader {
    type Task = BlockTask;

    fn source_type(&self) -> &'static str {
        "prometheus"
    }

    async fn connect(&mut self) -> Result<()> {
        let root = self.config.snapshot.clone();
        let blocks = tokio::task::spawn_blocking(move || list_blocks(&root))
            .await
            .map_err(|e| Error::SourceConnection(format!("snapshot scan failed: {}", e)))??;

        info!(
            "Opened Prometheus snapshot {} with {} blocks",
            self.config.snapshot.display(),
            blocks.len()
        );
        self.blocks = blocks;
        Ok(())
    }

    async fn explore(&self, filter: &Filter) -> Result<Vec<BlockTask>> {
        filter.validate()?;
        LabelMatcher::from_filter(filter)?;

        let tasks: Vec<BlockTask> = self
            .blocks
            .iter()
            .filter(|b| filter.overlaps(b.meta.min_time, b.meta.max_time))
            .cloned()
            .collect();

        info!(
            "{} of {} blocks overlap the time filter",
            tasks.len(),
            self.blocks.len()
        );
        Ok(tasks)
    }

    async fn read(&self, task: &BlockTask, filter: &Filter) -> Result<ChunkStream> {
        let matcher = LabelMatcher::from_filter(filter)?;
        let dir = task.dir.clone();
        let block = tokio::task::spawn_blocking(move || Block::open(&dir))
            .await
            .map_err(|e| Error::chunk_read(task.to_string(), e))?
            .map_err(|e| Error::chunk_read(task.to_string(), e))?;

        debug!(
            "Reading {} (index v{}, {} symbols, {} segments)",
            task,
            block.index.version(),
            block.index.symbol_count(),
            block.chunks.segment_count()
        );

        let walk = SeriesWalk {
            cursor: block.index.series_start(),
            block,
            task: task.to_string(),
            matcher,
            start: filter.start_millis(),
            end: filter.end_millis(),
            done: false,
        };

        Ok(Box::pin(stream::unfold(Some(walk), |walk| async move {
            let mut walk = walk?;
            loop {
                let task = walk.task.clone();
                // Index and chunk decoding touch mmapped pages; keep them off
                // the runtime and return to it after every step.
                let step = tokio::task::spawn_blocking(move || {
                    let step = walk.step(SERIES_PER_STEP);
                    (step, walk)
                })
                .await;

                match step {
                    Ok((Step::Chunk(item), next)) => return Some((item, Some(next))),
                    Ok((Step::Skipped, next)) => walk = next,
                    Ok((Step::Done, _)) => return None,
                    Err(e) => return Some((Err(Error::chunk_read(task, e)), None)),
                }
            }
        })))
    }

    async fn close(&mut self) -> Result<()> {
        self.blocks.clear();
        Ok(())
    }
}

fn list_blocks(root: &Path) -> Result<Vec<BlockTask>> {
    let entries = fs::read_dir(root).map_err(|e| {
        Error::SourceConnection(format!("cannot open snapshot {}: {}", root.display(), e))
    })?;

    let mut blocks = Vec::new();
    for entry in entries {
        let dir = entry?.path();
        if !dir.join("meta.json").is_file() {
            continue;
        }
        match BlockMeta::read(&dir) {
            Ok(meta) => blocks.push(BlockTask { dir, meta }),
            Err(e) => warn!("Skipping block {}: {}", dir.display(), e),
        }
    }
    blocks.sort_by_key(|b| (b.meta.min_time, b.meta.max_time));
    Ok(blocks)
}

/// Series examined per blocking step before the walk returns to the runtime.
const SERIES_PER_STEP: usize = 1024;

/// Outcome of one [`SeriesWalk::step`].
enum Step {
    Chunk(Result<Chunk>),
    /// The step budget ran out without a matching series.
    Skipped,
    Done,
}

/// Iteration state over the series of one block.
struct SeriesWalk {
    block: Block,
    cursor: usize,
    task: String,
    matcher: Option<LabelMatcher>,
    start: i64,
    end: i64,
    done: bool,
}

impl SeriesWalk {
    /// Advances to the next series with samples, examining at most `budget`
    /// series.
    fn step(&mut self, budget: usize) -> Step {
        for _ in 0..budget {
            if self.done {
                return Step::Done;
            }
            let series = match self.block.index.next_series(&mut self.cursor) {
                Ok(Some(series)) => series,
                Ok(None) => {
                    self.done = true;
                    return Step::Done;
                }
                Err(e) => {
                    // The series section cannot be resynchronized
                    self.done = true;
                    return Step::Chunk(Err(Error::chunk_read(self.task.clone(), e)));
                }
            };

            if let Some(matcher) = &self.matcher {
                if !matcher.matches(&series.labels) {
                    continue;
                }
            }

            let (timestamps, values) = match self.block.samples(&series, self.start, self.end) {
                Ok(samples) => samples,
                Err(e) => {
                    let id = format!("{} {}", self.task, describe(&series.labels));
                    return Step::Chunk(Err(Error::chunk_read(id, e)));
                }
            };
            if timestamps.is_empty() {
                continue;
            }

            let mut name = String::new();
            let mut labels = Vec::with_capacity(series.labels.len());
            for (k, v) in series.labels {
                if k == METRIC_NAME_LABEL {
                    name = v;
                } else {
                    labels.push(Label::new(k, v));
                }
            }
            return Step::Chunk(Ok(Chunk::single(name, labels, timestamps, values)));
        }
        Step::Skipped
    }
}

fn describe(labels: &[(String, String)]) -> String {
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={:?}", k, v)).collect();
    format!("{{{}}}", pairs.join(", "))
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
