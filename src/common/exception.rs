use thiserror::Error;

/// Outcomes of a lock operation other than success.
///
/// `NotGranted` and `Deadlock` are expected results that the transaction layer
/// acts upon; they are returned, never panicked on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock not granted")]
    NotGranted,
    #[error("Deadlock detected")]
    Deadlock,
    #[error("Out of lock memory")]
    OutOfLocks,
    #[error("Max lock memory {requested} is below current lock memory {current}")]
    MaxLockMemoryTooSmall { requested: u64, current: u64 },
    #[error("Locktree create callback failed: {0}")]
    CreateCallback(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
