//! Runtime logging
//!
//! Each line is tagged with the execution context of the calling
//! thread: which strand is draining, on which pool worker. The runtime
//! enters and leaves contexts with RAII scopes, so a line logged from a
//! strand callback reads `[s12@w3]`, one from a bare worker `[-@w3]`,
//! and one from a foreign thread (timer, poller, tests) `[-]`.
//!
//! A line is formatted into a local buffer and written to stderr with a
//! single locked write, so concurrent workers never interleave halves
//! of two lines.
//!
//! # Environment Variables
//!
//! - `COSTRAND_LOG_LEVEL=<level>` - off, error, warn, info, debug,
//!   trace (or 0-5); default warn
//! - `COSTRAND_LOG_FLUSH` - flush stderr after each line
//! - `COSTRAND_LOG_TIME` - prefix lines with microseconds since start
//!
//! # Usage
//!
//! ```ignore
//! use costrand_core::{cdebug, cinfo};
//!
//! cdebug!("draining strand {}", id);
//! cinfo!("pool started with {} workers", n);
//! ```

use crate::env;

use std::cell::Cell;
use std::fmt::{self, Write as _};
use std::io::Write as _;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Log levels, most severe first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Off => "OFF",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(LogLevel::Off),
            "error" | "1" => Ok(LogLevel::Error),
            "warn" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            _ => Err(()),
        }
    }
}

impl LogLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Output options, fixed at first use
struct Output {
    flush: bool,
    time: bool,
    start: Instant,
}

static OUTPUT: OnceLock<Output> = OnceLock::new();

/// Current level. `UNSET` defers to the environment on first read;
/// `set_log_level` overrides at any time.
const LEVEL_UNSET: u8 = u8::MAX;
static LEVEL: AtomicU8 = AtomicU8::new(LEVEL_UNSET);

fn output() -> &'static Output {
    OUTPUT.get_or_init(|| Output {
        flush: env::flag("COSTRAND_LOG_FLUSH"),
        time: env::flag("COSTRAND_LOG_TIME"),
        start: Instant::now(),
    })
}

/// Current log level
pub fn log_level() -> LogLevel {
    let v = LEVEL.load(Ordering::Relaxed);
    if v != LEVEL_UNSET {
        return LogLevel::from_u8(v);
    }
    let level = env::parse("COSTRAND_LOG_LEVEL").unwrap_or(LogLevel::Warn);
    LEVEL.store(level as u8, Ordering::Relaxed);
    level
}

/// Override the log level at runtime
pub fn set_log_level(level: LogLevel) {
    LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Execution context of the calling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogContext {
    /// Pool worker this thread is, if any
    pub worker: Option<u32>,

    /// Strand currently draining on this thread, if any
    pub strand: Option<u64>,
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.strand, self.worker) {
            (Some(s), Some(w)) => write!(f, "[s{}@w{}]", s, w),
            (None, Some(w)) => write!(f, "[-@w{}]", w),
            (Some(s), None) => write!(f, "[s{}]", s),
            (None, None) => f.write_str("[-]"),
        }
    }
}

thread_local! {
    static CONTEXT: Cell<LogContext> = const { Cell::new(LogContext { worker: None, strand: None }) };
}

/// The calling thread's current context
#[inline]
pub fn context() -> LogContext {
    CONTEXT.with(|c| c.get())
}

/// Scope guard restoring the previous context on drop
pub struct ContextScope {
    prev: LogContext,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        CONTEXT.with(|c| c.set(self.prev));
    }
}

/// Mark this thread as pool worker `id` for the scope's lifetime
pub fn worker_scope(id: u32) -> ContextScope {
    CONTEXT.with(|c| {
        let prev = c.get();
        c.set(LogContext {
            worker: Some(id),
            ..prev
        });
        ContextScope { prev }
    })
}

/// Mark this thread as draining strand `id` for the scope's lifetime
pub fn strand_scope(id: u64) -> ContextScope {
    CONTEXT.with(|c| {
        let prev = c.get();
        c.set(LogContext {
            strand: Some(id),
            ..prev
        });
        ContextScope { prev }
    })
}

/// Format and write one line. Called through the level macros.
pub fn emit(level: LogLevel, args: fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let out = output();

    let mut line = String::with_capacity(96);
    let _ = write!(line, "[{:<5}] ", level);
    if out.time {
        let _ = write!(line, "[{:>9}us] ", out.start.elapsed().as_micros());
    }
    let _ = write!(line, "{} {}", context(), args);
    line.push('\n');

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_all(line.as_bytes());
    if out.flush {
        let _ = handle.flush();
    }
}

/// Log at an explicit level: `clog!(Info, "...")`
#[macro_export]
macro_rules! clog {
    ($level:ident, $($arg:tt)*) => {
        $crate::clog::emit($crate::clog::LogLevel::$level, format_args!($($arg)*))
    };
}

/// Error level log with context
#[macro_export]
macro_rules! cerror {
    ($($arg:tt)*) => { $crate::clog!(Error, $($arg)*) };
}

/// Warning level log with context
#[macro_export]
macro_rules! cwarn {
    ($($arg:tt)*) => { $crate::clog!(Warn, $($arg)*) };
}

/// Info level log with context
#[macro_export]
macro_rules! cinfo {
    ($($arg:tt)*) => { $crate::clog!(Info, $($arg)*) };
}

/// Debug level log with context
#[macro_export]
macro_rules! cdebug {
    ($($arg:tt)*) => { $crate::clog!(Debug, $($arg)*) };
}

/// Trace level log with context
#[macro_export]
macro_rules! ctrace {
    ($($arg:tt)*) => { $crate::clog!(Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("warn".parse(), Ok(LogLevel::Warn));
        assert_eq!(" TRACE ".parse(), Ok(LogLevel::Trace));
        assert_eq!("4".parse(), Ok(LogLevel::Debug));
        assert_eq!("nope".parse::<LogLevel>(), Err(()));
    }

    // Level state is global, so everything touching it lives in one test.
    #[test]
    fn test_level_gate_and_macros() {
        set_log_level(LogLevel::Info);
        assert!(level_enabled(LogLevel::Error));
        assert!(level_enabled(LogLevel::Info));
        assert!(!level_enabled(LogLevel::Debug));

        set_log_level(LogLevel::Off);
        assert!(!level_enabled(LogLevel::Error));
        // Off itself never passes the gate
        assert!(!level_enabled(LogLevel::Off));

        // Macro surface, silenced
        clog!(Info, "x {}", 1);
        cerror!("e");
        cwarn!("w");
        cinfo!("i");
        cdebug!("d");
        ctrace!("t");
    }

    #[test]
    fn test_scopes_nest_and_restore() {
        assert_eq!(context(), LogContext::default());

        let _w = worker_scope(2);
        assert_eq!(context().worker, Some(2));
        assert_eq!(context().strand, None);

        {
            let _s = strand_scope(9);
            assert_eq!(context(), LogContext { worker: Some(2), strand: Some(9) });

            // An inner strand scope shadows and restores
            {
                let _s2 = strand_scope(10);
                assert_eq!(context().strand, Some(10));
            }
            assert_eq!(context().strand, Some(9));
        }
        assert_eq!(context().strand, None);
        assert_eq!(context().worker, Some(2));

        drop(_w);
        assert_eq!(context(), LogContext::default());
    }

    #[test]
    fn test_context_rendering() {
        let both = LogContext { worker: Some(3), strand: Some(12) };
        assert_eq!(both.to_string(), "[s12@w3]");
        let worker = LogContext { worker: Some(3), strand: None };
        assert_eq!(worker.to_string(), "[-@w3]");
        assert_eq!(LogContext::default().to_string(), "[-]");
    }

}
