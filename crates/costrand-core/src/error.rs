//! Error types for runtime setup and lifecycle
//!
//! Steady-state operations never fail this way: channel and socket
//! completions report through `AsyncState` / `IoResult` codes instead.
//! These errors cover pool construction, configuration and shutdown.

use core::fmt;

/// Result type for runtime setup operations
pub type RtResult<T> = Result<T, RtError>;

/// Errors from pool and runtime lifecycle operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtError {
    /// Configuration failed validation
    InvalidConfig(ConfigError),

    /// Failed to spawn an OS worker thread
    SpawnFailed,

    /// Pool was already started
    AlreadyStarted,

    /// Pool has been shut down
    ShutDown,

    /// Platform-specific error code
    PlatformError(i32),
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::InvalidConfig(e) => write!(f, "invalid configuration: {}", e),
            RtError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            RtError::AlreadyStarted => write!(f, "pool already started"),
            RtError::ShutDown => write!(f, "pool has been shut down"),
            RtError::PlatformError(code) => write!(f, "platform error: {}", code),
        }
    }
}

impl std::error::Error for RtError {}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Worker count is zero
    NoWorkers,

    /// Worker count exceeds the supported maximum
    TooManyWorkers,

    /// Batch limit is zero
    ZeroBatch,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoWorkers => write!(f, "worker count must be at least 1"),
            ConfigError::TooManyWorkers => write!(f, "worker count exceeds maximum"),
            ConfigError::ZeroBatch => write!(f, "batch limit must be at least 1"),
        }
    }
}

impl From<ConfigError> for RtError {
    fn from(e: ConfigError) -> Self {
        RtError::InvalidConfig(e)
    }
}
