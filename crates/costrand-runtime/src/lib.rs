//! # costrand-runtime
//!
//! The execution substrate of the costrand actor runtime: a reactor
//! pool of OS worker threads, strands that serialize callbacks on top
//! of it, and the timer subsystem.
//!
//! ```text
//!   post()/timers ──► injector queue ──► worker threads
//!                                           │
//!                        strand drain ◄─────┘
//!                  (one worker per strand at a time)
//! ```
//!
//! ## Modules
//!
//! - `pool` - `IoPool` worker threads over a shared injector queue
//! - `strand` - `Strand` FIFO serialization contexts
//! - `timer` - `TimerQueue`, timer thread, strand-bound `AsyncTimer`
//! - `parking` - idle-worker sleep/wake (futex on Linux)
//! - `config` - `PoolConfig` with env overrides

pub mod config;
pub mod parking;
pub mod pool;
pub mod strand;
pub mod timer;

pub use config::PoolConfig;
pub use pool::IoPool;
pub use strand::Strand;
pub use timer::{AsyncTimer, TimerId, TimerQueue};
