//! Environment overrides
//!
//! Two ways of reading an override, matching how the runtime consumes
//! them: typed values through `parse`/`parse_or`, and switches through
//! `flag`.
//!
//! ```ignore
//! use costrand_core::env;
//!
//! let workers = env::parse_or("COSTRAND_WORKERS", 4usize);
//! if env::flag("COSTRAND_DEBUG") { /* ... */ }
//! ```

use std::str::FromStr;

/// Read and parse an override. `None` when the variable is unset or
/// does not parse; surrounding whitespace is ignored.
pub fn parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    raw.trim().parse().ok()
}

/// Read and parse an override, falling back to `default`
pub fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    parse(key).unwrap_or(default)
}

/// Read a switch. Setting the variable turns the switch on unless the
/// value is explicitly falsy ("0", "false", "no", "off", empty);
/// unset means off.
pub fn flag(key: &str) -> bool {
    match std::env::var(key) {
        Ok(raw) => !matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "false" | "no" | "off"
        ),
        Err(_) => false,
    }
}
