//! # costrand-core
//!
//! Platform-agnostic building blocks for the costrand actor runtime.
//! Nothing in here touches the OS beyond stderr and environment
//! variables; the reactor pool, strands and timers live in
//! `costrand-runtime`.
//!
//! ## Modules
//!
//! - `state` - `AsyncState` completion codes for async operations
//! - `sign` - `SharedSign` disarm flag and `NotifySign` watch tokens
//! - `spinlock` - internal ticket spinlock primitive
//! - `error` - runtime setup error types
//! - `env` - environment override readers
//! - `clog` - context-tagged stderr logging macros

pub mod clog;
pub mod env;
pub mod error;
pub mod sign;
pub mod spinlock;
pub mod state;

// Re-exports for convenience
pub use clog::LogLevel;
pub use error::{ConfigError, RtError, RtResult};
pub use sign::{NotifySign, SharedSign};
pub use spinlock::SpinLock;
pub use state::AsyncState;

/// Runtime-wide constants
pub mod constants {
    /// Maximum workers (OS threads) per pool
    pub const MAX_WORKERS: usize = 64;

    /// Default jobs a strand drains per pool wake before re-posting itself
    pub const DEFAULT_BATCH_LIMIT: usize = 128;

    /// Default park timeout for idle workers, in milliseconds
    pub const DEFAULT_PARK_TIMEOUT_MS: u64 = 100;

    /// Cache line size for alignment
    pub const CACHE_LINE_SIZE: usize = 64;
}
