//! Worker parking
//!
//! Idle workers sleep on a generation counter (an eventcount): a worker
//! takes a token, re-checks the queue, and sleeps only while the
//! generation still matches its token. Every wake bumps the generation,
//! so a wake that lands between the re-check and the sleep is never
//! lost - the sleep returns immediately because the token is stale.
//!
//! The Linux build puts the generation in a futex word; other platforms
//! use a mutex + condvar around it.

use std::time::Duration;

/// Platform-specific worker parking mechanism
///
/// Sleep protocol:
///
/// ```ignore
/// let token = parking.prepare();
/// match queue.pop() {
///     Some(work) => run(work),
///     None => { parking.park(token, Some(timeout)); }
/// }
/// ```
///
/// Wake sources (`post`, shutdown) call `wake_one()`/`wake_all()` after
/// publishing the work the sleepers should see.
pub trait Parking: Send + Sync {
    /// Take the current generation token. Work published before a
    /// subsequent `park` with this token is either visible to the
    /// caller's re-check or invalidates the token.
    fn prepare(&self) -> u32;

    /// Sleep until the generation moves past `token` or the timeout
    /// elapses. Returns `true` if the token was invalidated (a wake
    /// happened), `false` on plain timeout. Spurious returns are fine;
    /// callers re-check for work either way.
    fn park(&self, token: u32, timeout: Option<Duration>) -> bool;

    /// Advance the generation and wake one sleeping worker
    fn wake_one(&self);

    /// Advance the generation and wake every sleeping worker
    /// (shutdown, bursts)
    fn wake_all(&self);

    /// Number of currently sleeping workers (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::CondvarParking as PlatformParking;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_park_times_out() {
        let parking = PlatformParking::new();
        let token = parking.prepare();
        let start = std::time::Instant::now();
        let woken = parking.park(token, Some(Duration::from_millis(50)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wake_one_unparks() {
        let parking = Arc::new(PlatformParking::new());
        let parking2 = Arc::clone(&parking);

        let handle = thread::spawn(move || {
            let token = parking2.prepare();
            parking2.park(token, Some(Duration::from_secs(10)))
        });

        thread::sleep(Duration::from_millis(50));
        parking.wake_one();

        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wake_between_prepare_and_park_not_lost() {
        let parking = PlatformParking::new();
        let token = parking.prepare();
        // The wake lands before the sleep: the token is stale, so the
        // park returns immediately instead of waiting out the timeout.
        parking.wake_one();
        let start = std::time::Instant::now();
        assert!(parking.park(token, Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wake_all_unparks_everyone() {
        let parking = Arc::new(PlatformParking::new());
        let mut handles = vec![];
        for _ in 0..3 {
            let parking = Arc::clone(&parking);
            handles.push(thread::spawn(move || {
                let token = parking.prepare();
                parking.park(token, Some(Duration::from_secs(10)))
            }));
        }

        thread::sleep(Duration::from_millis(50));
        parking.wake_all();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
