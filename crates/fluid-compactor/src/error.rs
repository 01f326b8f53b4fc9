use crate::engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("database is empty")]
    EmptyDatabase,

    #[error("compaction failed: {0}")]
    CompactionFatal(EngineError),

    #[error("compaction did not finish: {0}")]
    CompactionTransient(EngineError),

    #[error("{failed} of {planned} writes failed")]
    WriteFailure { failed: usize, planned: usize },

    #[error("key file error: {0}")]
    KeyFile(#[from] fluid_datagen::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
