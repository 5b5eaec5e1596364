use thiserror::Error;

/// Storage engine error types.
///
/// Expected operational outcomes (pool exhaustion, pinned deletion,
/// duplicate keys) travel as `Option`/`bool` returns on the APIs that
/// produce them; these variants cover the I/O and setup paths.
#[derive(Error, Debug)]
pub enum BurrowError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Disk scheduler error: {0}")]
    DiskScheduler(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, BurrowError>;
