//! The readiness poller
//!
//! One epoll instance on a dedicated OS thread. Sockets register
//! one-shot read/write callbacks against their fd; on readiness the
//! callback fires (typically posting an operation step back onto the
//! socket's strand). An eventfd wakes the thread for registration
//! changes and shutdown.

use costrand_core::cerror;
use costrand_core::spinlock::SpinLock;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Which readiness a callback waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// One-shot readiness callback; the argument is true when the fd
/// reported an error or hang-up alongside (or instead of) readiness
pub type IoCallback = Box<dyn FnOnce(bool) + Send>;

#[derive(Default)]
struct FdEntry {
    read: Option<IoCallback>,
    write: Option<IoCallback>,
}

impl FdEntry {
    fn flags(&self) -> EpollFlags {
        let mut flags = EpollFlags::EPOLLONESHOT;
        if self.read.is_some() {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write.is_some() {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// Token marking the wake eventfd in epoll data
const WAKE_TOKEN: u64 = u64::MAX;

struct PollerInner {
    epoll: Epoll,
    /// eventfd used to interrupt the wait for shutdown
    waker: OwnedFd,
    regs: SpinLock<HashMap<RawFd, FdEntry>>,
    live: AtomicBool,
    thread: SpinLock<Option<JoinHandle<()>>>,
}

fn new_eventfd() -> std::io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ring_eventfd(fd: RawFd) {
    let one: u64 = 1;
    unsafe {
        libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
    }
}

fn drain_eventfd(fd: RawFd) {
    let mut value: u64 = 0;
    unsafe {
        libc::read(fd, &mut value as *mut u64 as *mut libc::c_void, 8);
    }
}

/// Handle to the poller. Clones share it.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

impl Poller {
    /// Create the epoll instance and start the poller thread
    pub fn start() -> std::io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let waker = new_eventfd()?;
        epoll.add(
            waker.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN),
        )?;

        let inner = Arc::new(PollerInner {
            epoll,
            waker,
            regs: SpinLock::new(HashMap::new()),
            live: AtomicBool::new(true),
            thread: SpinLock::new(None),
        });

        let run_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("costrand-poller".into())
            .spawn(move || poll_loop(run_inner))?;
        *inner.thread.lock() = Some(handle);

        Ok(Self { inner })
    }

    /// Arm a one-shot callback for `interest` on `fd`. A previous
    /// callback for the same interest is replaced (and dropped). If the
    /// fd cannot be registered the callback fires immediately with the
    /// error flag set, so a waiting operation always makes progress.
    pub fn watch(&self, fd: RawFd, interest: Interest, cb: IoCallback) {
        let failed = {
            let mut regs = self.inner.regs.lock();
            let fresh = !regs.contains_key(&fd);
            let entry = regs.entry(fd).or_default();
            match interest {
                Interest::Read => entry.read = Some(cb),
                Interest::Write => entry.write = Some(cb),
            }
            // A fired one-shot stays in the epoll set (disabled) after its
            // entry is dropped, and a closed fd leaves the set on its own,
            // so ADD and MOD must each fall back to the other.
            let event = EpollEvent::new(entry.flags(), fd as u64);
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let rc = if fresh {
                match self.inner.epoll.add(borrowed, event) {
                    Err(nix::errno::Errno::EEXIST) => {
                        let mut event = event;
                        self.inner.epoll.modify(borrowed, &mut event)
                    }
                    other => other,
                }
            } else {
                let mut ev = event;
                match self.inner.epoll.modify(borrowed, &mut ev) {
                    Err(nix::errno::Errno::ENOENT) => self.inner.epoll.add(borrowed, event),
                    other => other,
                }
            };
            match rc {
                Ok(()) => None,
                Err(e) => {
                    let taken = match interest {
                        Interest::Read => entry.read.take(),
                        Interest::Write => entry.write.take(),
                    };
                    if entry.is_empty() {
                        regs.remove(&fd);
                    }
                    Some((e, taken))
                }
            }
        };
        if let Some((e, cb)) = failed {
            cerror!("epoll registration for fd {} failed: {}", fd, e);
            if let Some(cb) = cb {
                cb(true);
            }
        }
    }

    /// Drop any pending callbacks and deregister `fd`. Called when a
    /// socket is torn down.
    pub fn unwatch(&self, fd: RawFd) {
        let entry = self.inner.regs.lock().remove(&fd);
        if entry.is_some() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            // Best effort: a closed fd has already left the epoll set.
            let _ = self.inner.epoll.delete(borrowed);
        }
    }

    /// Fire `fd`'s pending callbacks now, with the error flag set.
    /// Timed connect/accept paths use this when their timer wins.
    pub fn kick(&self, fd: RawFd) {
        let (read, write) = {
            let mut regs = self.inner.regs.lock();
            match regs.get_mut(&fd) {
                Some(entry) => (entry.read.take(), entry.write.take()),
                None => (None, None),
            }
        };
        if let Some(cb) = read {
            cb(true);
        }
        if let Some(cb) = write {
            cb(true);
        }
    }

    /// Stop the poller thread. Pending callbacks are dropped.
    pub fn shutdown(&self) {
        if !self.inner.live.swap(false, Ordering::SeqCst) {
            return;
        }
        ring_eventfd(self.inner.waker.as_raw_fd());
        if let Some(handle) = self.inner.thread.lock().take() {
            let _ = handle.join();
        }
        self.inner.regs.lock().clear();
    }
}

fn poll_loop(inner: Arc<PollerInner>) {
    let mut events = vec![EpollEvent::empty(); 64];

    while inner.live.load(Ordering::Acquire) {
        let n = match inner.epoll.wait(&mut events, EpollTimeout::from(500u16)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                cerror!("poller wait failed: {}", e);
                break;
            }
        };

        for event in &events[..n] {
            let data = event.data();
            if data == WAKE_TOKEN {
                drain_eventfd(inner.waker.as_raw_fd());
                continue;
            }

            let fd = data as RawFd;
            let flags = event.events();
            let failed = flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP);

            let (read, write) = {
                let mut regs = inner.regs.lock();
                let entry = match regs.get_mut(&fd) {
                    Some(entry) => entry,
                    None => continue,
                };
                let read = if failed || flags.contains(EpollFlags::EPOLLIN) {
                    entry.read.take()
                } else {
                    None
                };
                let write = if failed || flags.contains(EpollFlags::EPOLLOUT) {
                    entry.write.take()
                } else {
                    None
                };
                if entry.is_empty() {
                    regs.remove(&fd);
                } else {
                    // The one-shot disarmed the fd; re-arm what remains.
                    let mut event = EpollEvent::new(entry.flags(), fd as u64);
                    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                    let _ = inner.epoll.modify(borrowed, &mut event);
                }
                (read, write)
            };

            if let Some(cb) = read {
                cb(failed);
            }
            if let Some(cb) = write {
                cb(failed);
            }
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("live", &self.inner.live.load(Ordering::Relaxed))
            .field("watched", &self.inner.regs.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_read_readiness_fires() {
        let poller = Poller::start().unwrap();
        let (mut a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let (tx, rx) = mpsc::channel();

        poller
            .watch(
                b.as_raw_fd(),
                Interest::Read,
                Box::new(move |err| tx.send(err).unwrap()),
            );

        a.write_all(b"x").unwrap();

        assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
        poller.shutdown();
    }

    #[test]
    fn test_kick_fires_with_error_flag() {
        let poller = Poller::start().unwrap();
        let (_a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let (tx, rx) = mpsc::channel();

        poller
            .watch(
                b.as_raw_fd(),
                Interest::Read,
                Box::new(move |err| tx.send(err).unwrap()),
            );

        poller.kick(b.as_raw_fd());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        poller.shutdown();
    }

    #[test]
    fn test_unwatch_drops_callback() {
        let poller = Poller::start().unwrap();
        let (mut a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let (tx, rx) = mpsc::channel::<bool>();

        poller
            .watch(
                b.as_raw_fd(),
                Interest::Read,
                Box::new(move |err| tx.send(err).unwrap()),
            );
        poller.unwatch(b.as_raw_fd());

        a.write_all(b"x").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        poller.shutdown();
    }
}
