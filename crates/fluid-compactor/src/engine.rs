//! Storage engine contract.
//!
//! The controller never touches the data path. Everything it needs from the
//! engine underneath is captured by [`StorageEngine`]: a metadata snapshot,
//! a file-level compaction primitive, flushes, writes, and a knob for the
//! write buffer size. The read side lives in the separate [`QueryEngine`]
//! trait so that the controller's required surface stays as narrow as the
//! policy actually is; only the workload phases ask for reads.
//!
//! Compaction and flush are blocking engine operations, so they are exposed
//! as futures and executed on the runtime's background workers. Metadata
//! lookups are cheap and synchronous, which lets the picker hold its
//! metadata mutex across a snapshot without parking a worker.

use crate::levels::LevelMeta;
use std::future::Future;
use thiserror::Error;

/// Engine-reported failure, split by how the scheduler must react.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Lost I/O. Fatal to the task; data correctness is the engine's job.
    #[error("I/O error: {0}")]
    Io(String),

    /// The request itself was malformed (unknown file, bad level). Fatal.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An input file is already claimed by a running compaction.
    #[error("busy: {0}")]
    Busy(String),

    /// Any other non-OK status.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Fatal failures are surfaced and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Io(_) | EngineError::InvalidArgument(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Options handed to [`StorageEngine::compact_files`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionOptions {
    /// Output is cut into files no larger than this.
    pub output_file_size_limit: u64,
}

/// Write-path options, mirrored from the engine's write API.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub sync: bool,
    pub disable_wal: bool,
    pub low_priority: bool,
    pub no_slowdown: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            sync: false,
            disable_wal: false,
            low_priority: false,
            no_slowdown: false,
        }
    }
}

impl WriteOptions {
    /// The bulk-load profile: no WAL, below-compaction priority.
    pub fn bulk_load() -> Self {
        Self {
            sync: false,
            disable_wal: true,
            low_priority: true,
            no_slowdown: false,
        }
    }
}

/// An atomic group of puts.
#[derive(Debug, Default)]
pub struct WriteBatch {
    entries: Vec<(String, String)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: String, value: String) {
        self.entries.push((key, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<(String, String)> {
        self.entries
    }
}

/// Delivered by the engine when a memtable flush lands on disk.
#[derive(Debug, Clone)]
pub struct FlushInfo {
    pub cf_name: String,
    /// The flush pushed the engine into a write slowdown; transient
    /// compaction failures are worth retrying under that pressure.
    pub triggered_writes_slowdown: bool,
}

/// Flush-completion subscription.
pub trait FlushListener: Send + Sync {
    fn on_flush_completed(&self, info: &FlushInfo);
}

/// The engine capabilities the controller consumes.
pub trait StorageEngine: Send + Sync + 'static {
    /// Snapshot of per-level file metadata, index 0 upward.
    fn level_metadata(&self) -> Vec<LevelMeta>;

    /// Adjusts the in-memory write buffer size.
    fn set_buffer_size(&self, bytes: u64);

    /// Merges `input_files` into `output_level`, honoring the output file
    /// size limit. Returns the names of the files produced.
    fn compact_files(
        &self,
        opts: CompactionOptions,
        input_files: Vec<String>,
        output_level: usize,
    ) -> impl Future<Output = EngineResult<Vec<String>>> + Send;

    /// Flushes the memtable; `wait` blocks until the flush lands.
    fn flush(&self, wait: bool) -> impl Future<Output = EngineResult<()>> + Send;

    fn put(
        &self,
        opts: &WriteOptions,
        key: String,
        value: String,
    ) -> impl Future<Output = EngineResult<()>> + Send;

    fn write_batch(
        &self,
        opts: &WriteOptions,
        batch: WriteBatch,
    ) -> impl Future<Output = EngineResult<()>> + Send;
}

/// Read capabilities, needed only by the workload phases.
pub trait QueryEngine: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = EngineResult<Option<String>>> + Send;

    /// Counts live entries in `[lower, upper)`.
    fn scan(&self, lower: &str, upper: &str) -> impl Future<Output = EngineResult<usize>> + Send;
}
