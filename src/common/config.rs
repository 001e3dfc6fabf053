use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::exception::ConfigError;

pub type TxnId = u64; // transaction id type
pub type DictionaryId = u64; // dictionary (table/index) id type

/// Reserved transaction id meaning "no transaction".
pub const TXNID_NONE: TxnId = 0;

/// Default process-wide budget for lock memory, in bytes.
pub const DEFAULT_MAX_LOCK_MEMORY: u64 = 64 * 1024 * 1024;

/// Once the single txnid buffer holds this many ranges the optimization is ended early.
pub const STO_BUFFER_MAX_SIZE: usize = 50 * 1024;

/// Clean releases needed after a forced migration before the optimization is tried again.
pub const STO_SCORE_THRESHOLD: u64 = 100;

/// Waits at least this long (microseconds) are counted as long waits.
pub const LONG_WAIT_THRESHOLD_US: u64 = 1_000_000;

pub const DEFAULT_LOCK_WAIT_TIME_MS: u64 = 4000;

/// Tunables for the locktree manager and the locktrees it creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocktreeConfig {
    pub max_lock_memory: u64,
    pub sto_enabled: bool,
    pub sto_buffer_max_size: usize,
    pub sto_score_threshold: u64,
    pub long_wait_threshold_us: u64,
    pub lock_wait_time_ms: u64,
}

impl Default for LocktreeConfig {
    fn default() -> Self {
        Self {
            max_lock_memory: DEFAULT_MAX_LOCK_MEMORY,
            sto_enabled: true,
            sto_buffer_max_size: STO_BUFFER_MAX_SIZE,
            sto_score_threshold: STO_SCORE_THRESHOLD,
            long_wait_threshold_us: LONG_WAIT_THRESHOLD_US,
            lock_wait_time_ms: DEFAULT_LOCK_WAIT_TIME_MS,
        }
    }
}

impl LocktreeConfig {
    /// Reads a TOML config file. Missing keys fall back to their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: LocktreeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_lock_memory == 0 {
            return Err(ConfigError::Invalid(
                "max_lock_memory must be greater than zero".to_string(),
            ));
        }
        if self.sto_buffer_max_size == 0 {
            return Err(ConfigError::Invalid(
                "sto_buffer_max_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
