//! fluid-compactor: a Fluid LSM compaction controller for a pluggable
//! storage engine.
//!
//! The Fluid LSM model parameterizes the shape of an LSM tree with three
//! knobs: the size ratio T between adjacent levels, the run bound K on every
//! level below the largest, and the run bound Z on the largest level. K = Z
//! = 1 is classic leveling, K = Z = T − 1 is classic tiering, and the space
//! in between trades write amplification against read amplification. This
//! crate decides *when*, *what*, and *how* to compact so that a third-party
//! engine's on-disk layout obeys a chosen (T, K, Z); the engine keeps
//! ownership of the data path.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Engine (external): memtable, flush, SSTables, CompactFiles │
//! └──────┬───────────────────────────────────────▲──────────────┘
//!        │ flush completed                       │ compact_files
//!        ↓                                       │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  FluidCompactor                                             │
//! │  - sweeps levels top-down on every flush                    │
//! │  - picks due levels under the metadata mutex                │
//! └──────────────┬──────────────────────────────────────────────┘
//!                │ CompactionTask
//!                ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  CompactionScheduler                                        │
//! │  - background worker per task, in-flight accounting         │
//! │  - bounded same-input retry on transient failure            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`loader::BulkLoader`] drives the same scheduler deterministically to
//! build a fresh tree bottom-up, and [`workload`] provides the timed phases
//! used to measure a built tree.
//!
//! # Example
//!
//! ```no_run
//! use fluid_compactor::config::FluidConfig;
//! use fluid_compactor::loader::BulkLoader;
//! use fluid_datagen::RandomKeySource;
//! use fluid_testkit::MemEngine;
//! use std::sync::Arc;
//!
//! # async fn example() -> fluid_compactor::Result<()> {
//! let config = FluidConfig::default();
//! let engine = Arc::new(MemEngine::new(16, config.buffer_size));
//!
//! let mut loader = BulkLoader::new(config, Arc::clone(&engine), RandomKeySource::new(0));
//! loader.bulk_load_entries(10_000).await?;
//! loader.write_existing_keys("/tmp/db")?;
//! loader.config().save_to_db_path("/tmp/db")?;
//! # Ok(())
//! # }
//! ```

pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod levels;
pub mod loader;
pub mod workload;

pub use compaction::{CompactionScheduler, CompactionTask, FluidCompactor, InFlight};
pub use config::{BulkLoadMode, FileSizePolicy, FluidConfig};
pub use engine::{
    CompactionOptions, EngineError, FlushInfo, FlushListener, QueryEngine, StorageEngine,
    WriteBatch, WriteOptions,
};
pub use error::{Error, Result};
pub use levels::{largest_occupied_level, LevelMeta, RunMeta};
pub use loader::BulkLoader;
