//! In-memory storage engine for exercising the compaction controller.
//!
//! [`MemEngine`] implements the full engine contract with deterministic,
//! inspectable state: a memtable with buffer-size auto-flush, per-level file
//! lists carrying `being_compacted` claims, a `compact_files` that merges
//! newest-wins and splits output by the file size limit, flush-completion
//! listener dispatch with a configurable write-slowdown trigger, and a
//! scripted failure queue for fault injection.
//!
//! Values are stored as lengths only and synthesized on read; the
//! controller never looks at value bytes, so tests stay cheap even for
//! multi-megabyte trees.
//!
//! # Example
//!
//! ```ignore
//! use fluid_testkit::MemEngine;
//! use fluid_compactor::EngineError;
//!
//! let engine = MemEngine::new(16, 1 << 20);
//! engine.fail_next_compaction(EngineError::Other("shutting down".into()));
//! ```

mod engine;

pub use engine::MemEngine;
