use thiserror::Error;

use crate::maps::Table;

#[derive(Error, Debug)]
pub enum Error {
    /// A write or delete against one of the kernel tables failed. Retryable;
    /// bookkeeping is not advanced past the failed row.
    #[error("map write failed on {table} table: {reason}")]
    MapWrite { table: Table, reason: String },

    #[error("map read failed on {table} table: {reason}")]
    MapRead { table: Table, reason: String },

    #[error("failed to load bpf map {name}: {reason}")]
    MapLoad { name: &'static str, reason: String },

    /// The id space ran out. The configured ceiling must be raised.
    #[error("{space} id space exhausted")]
    IdExhausted { space: &'static str },

    #[error("invalid frontend: {0}")]
    InvalidFrontend(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
