//! Pool configuration
//!
//! Built programmatically or from environment overrides; validated
//! before the pool starts.

use costrand_core::constants::{DEFAULT_BATCH_LIMIT, DEFAULT_PARK_TIMEOUT_MS, MAX_WORKERS};
use costrand_core::env;
use costrand_core::error::{ConfigError, RtResult};
use std::time::Duration;

/// Configuration for an [`IoPool`](crate::pool::IoPool)
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of OS worker threads
    pub workers: usize,

    /// How long an idle worker parks before re-checking for work
    pub park_timeout: Duration,

    /// Jobs a strand drains per pool wake before re-posting itself,
    /// so one busy strand cannot monopolize a worker
    pub batch_limit: usize,

    /// Emit worker lifecycle logs at debug level
    pub debug_logging: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            park_timeout: Duration::from_millis(DEFAULT_PARK_TIMEOUT_MS),
            batch_limit: DEFAULT_BATCH_LIMIT,
            debug_logging: false,
        }
    }
}

impl PoolConfig {
    /// Default configuration with an explicit worker count
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Apply `COSTRAND_WORKERS`, `COSTRAND_BATCH` and `COSTRAND_DEBUG`
    /// environment overrides on top of the current values
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            workers: env::parse_or("COSTRAND_WORKERS", base.workers),
            batch_limit: env::parse_or("COSTRAND_BATCH", base.batch_limit),
            debug_logging: base.debug_logging || env::flag("COSTRAND_DEBUG"),
            ..base
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> RtResult<()> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers.into());
        }
        if self.workers > MAX_WORKERS {
            return Err(ConfigError::TooManyWorkers.into());
        }
        if self.batch_limit == 0 {
            return Err(ConfigError::ZeroBatch.into());
        }
        Ok(())
    }
}
