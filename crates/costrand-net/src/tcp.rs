//! Strand-bound TCP sockets
//!
//! Every socket belongs to a strand; operation steps and completions
//! run there, so op state needs no locking. Wait-style operations are a
//! "try then register" loop: probe with a non-blocking syscall, on
//! `EAGAIN` park a one-shot callback with the poller. The `pre_option`
//! flag controls whether the probe runs before the first registration;
//! off, the op parks straight away (same result, one extra hop).
//!
//! Timed operations arm an [`AsyncTimer`] whose expiry shuts the socket
//! down; the pending op then completes with whatever it transferred so
//! far and `code == ETIMEDOUT`.

use crate::poller::{Interest, Poller};
use crate::sysio::{last_errno, sys_recv, sys_recvmmsg, sys_send, sys_sendmmsg, sys_so_error, sys_writev};
use crate::IoResult;

use costrand_runtime::strand::Strand;
use costrand_runtime::timer::AsyncTimer;

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Completion notify for buffer-carrying ops: the buffer comes back
/// together with the result
pub type IoNotify = Box<dyn FnOnce(Vec<u8>, IoResult) + Send>;

struct SockInner {
    io: TcpStream,
    strand: Strand,
    poller: Poller,
    pre_option: AtomicBool,
}

impl Drop for SockInner {
    fn drop(&mut self) {
        self.poller.unwatch(self.io.as_raw_fd());
    }
}

/// Handle to a strand-bound TCP stream. Clones share the socket.
#[derive(Clone)]
pub struct TcpSocket {
    inner: Arc<SockInner>,
}

impl TcpSocket {
    /// Wrap an established stream; switches it to non-blocking mode
    pub fn from_std(io: TcpStream, strand: &Strand, poller: &Poller) -> io::Result<Self> {
        io.set_nonblocking(true)?;
        Ok(Self {
            inner: Arc::new(SockInner {
                io,
                strand: strand.clone(),
                poller: poller.clone(),
                pre_option: AtomicBool::new(true),
            }),
        })
    }

    /// Non-blocking connect; `ntf` runs on `strand` with the connected
    /// socket or the error
    pub fn connect<N>(strand: &Strand, poller: &Poller, addr: SocketAddr, ntf: N)
    where
        N: FnOnce(io::Result<TcpSocket>) + Send + 'static,
    {
        Self::connect_inner(strand, poller, addr, None, ntf)
    }

    /// Connect with a deadline; `ETIMEDOUT` if the handshake loses the
    /// race against the timer
    pub fn timed_connect<N>(
        strand: &Strand,
        poller: &Poller,
        timer: &AsyncTimer,
        ms: u64,
        addr: SocketAddr,
        ntf: N,
    ) where
        N: FnOnce(io::Result<TcpSocket>) + Send + 'static,
    {
        Self::connect_inner(strand, poller, addr, Some((timer.clone(), ms)), ntf)
    }

    fn connect_inner<N>(
        strand: &Strand,
        poller: &Poller,
        addr: SocketAddr,
        deadline: Option<(AsyncTimer, u64)>,
        ntf: N,
    ) where
        N: FnOnce(io::Result<TcpSocket>) + Send + 'static,
    {
        let strand = strand.clone();
        let poller = poller.clone();

        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let raw = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if raw < 0 {
            let err = io::Error::last_os_error();
            strand.distribute(move || ntf(Err(err)));
            return;
        }
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };

        let (storage, len) = sockaddr_of(&addr);
        let rc = unsafe {
            libc::connect(raw, &storage as *const _ as *const libc::sockaddr, len)
        };
        if rc == 0 {
            let result = finish_connect(owned, &strand, &poller);
            strand.distribute(move || ntf(result));
            return;
        }

        let err = last_errno();
        if err != libc::EINPROGRESS {
            strand.distribute(move || ntf(Err(io::Error::from_raw_os_error(err))));
            return;
        }

        let overtime = Arc::new(AtomicBool::new(false));
        let timer = deadline.map(|(timer, ms)| {
            let flag = Arc::clone(&overtime);
            let kick_poller = poller.clone();
            timer.timeout(ms, move || {
                flag.store(true, Ordering::Release);
                kick_poller.kick(raw);
            });
            timer
        });

        let cb_strand = strand.clone();
        let cb_poller = poller.clone();
        poller.watch(
            raw,
            Interest::Write,
            Box::new(move |_failed| {
                let strand = cb_strand.clone();
                strand.distribute(move || {
                    if let Some(timer) = &timer {
                        timer.cancel();
                    }
                    if overtime.load(Ordering::Acquire) {
                        ntf(Err(io::Error::from_raw_os_error(libc::ETIMEDOUT)));
                        return;
                    }
                    let err = sys_so_error(raw);
                    if err != 0 {
                        ntf(Err(io::Error::from_raw_os_error(err)));
                        return;
                    }
                    ntf(finish_connect(owned, &cb_strand, &cb_poller));
                });
            }),
        );
    }

    /// The strand this socket is bound to
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.io.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.io.peer_addr()
    }

    /// Enable/disable the probe-before-register fast path
    pub fn set_pre_option(&self, enabled: bool) {
        self.inner.pre_option.store(enabled, Ordering::Relaxed);
    }

    pub fn pre_option(&self) -> bool {
        self.inner.pre_option.load(Ordering::Relaxed)
    }

    /// Shut down both directions; a pending op completes with what it
    /// has. The fd stays open until the last handle drops.
    pub fn shutdown_both(&self) {
        let _ = self.inner.io.shutdown(std::net::Shutdown::Both);
    }

    /// Read exactly `buf.len()` bytes (or fail with partial progress)
    pub fn read<N>(&self, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult) + Send + 'static,
    {
        self.start_read(buf, false, None, Box::new(ntf));
    }

    /// Read whatever arrives first (at least one byte)
    pub fn read_some<N>(&self, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult) + Send + 'static,
    {
        self.start_read(buf, true, None, Box::new(ntf));
    }

    /// `read` with a deadline; on expiry the socket is shut down and
    /// the completion reports partial progress with `ETIMEDOUT`
    pub fn timed_read<N>(&self, timer: &AsyncTimer, ms: u64, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult) + Send + 'static,
    {
        self.start_read(buf, false, Some((timer.clone(), ms)), Box::new(ntf));
    }

    /// `read_some` with a deadline
    pub fn timed_read_some<N>(&self, timer: &AsyncTimer, ms: u64, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult) + Send + 'static,
    {
        self.start_read(buf, true, Some((timer.clone(), ms)), Box::new(ntf));
    }

    /// Write the whole buffer
    pub fn write<N>(&self, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult) + Send + 'static,
    {
        self.start_write(buf, false, None, Box::new(ntf));
    }

    /// Write whatever fits in one syscall
    pub fn write_some<N>(&self, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult) + Send + 'static,
    {
        self.start_write(buf, true, None, Box::new(ntf));
    }

    /// `write` with a deadline
    pub fn timed_write<N>(&self, timer: &AsyncTimer, ms: u64, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult) + Send + 'static,
    {
        self.start_write(buf, false, Some((timer.clone(), ms)), Box::new(ntf));
    }

    /// One non-blocking recv; `would_block` when nothing is readable
    pub fn try_read(&self, buf: &mut [u8]) -> IoResult {
        sys_recv(self.inner.io.as_raw_fd(), buf)
    }

    /// One non-blocking send
    pub fn try_write(&self, data: &[u8]) -> IoResult {
        sys_send(self.inner.io.as_raw_fd(), data)
    }

    /// One writev(2) over the buffer list; `bytes` counts bytes
    pub fn try_write_vectored(&self, bufs: &[&[u8]]) -> IoResult {
        sys_writev(self.inner.io.as_raw_fd(), bufs)
    }

    /// Multi-buffer send via sendmmsg(2): `bytes` counts fully sent
    /// buffers, the second value is the byte count of the last partial
    /// buffer
    pub fn try_send_chunks(&self, chunks: &[&[u8]]) -> (IoResult, usize) {
        sys_sendmmsg(self.inner.io.as_raw_fd(), chunks, 0)
    }

    /// Multi-buffer receive via recvmmsg(2), same accounting as
    /// [`try_send_chunks`](Self::try_send_chunks)
    pub fn try_recv_chunks(&self, bufs: &mut [&mut [u8]]) -> (IoResult, usize) {
        sys_recvmmsg(self.inner.io.as_raw_fd(), bufs, 0)
    }

    fn start_read(
        &self,
        buf: Vec<u8>,
        some: bool,
        deadline: Option<(AsyncTimer, u64)>,
        ntf: IoNotify,
    ) {
        let timer = self.arm_shutdown_timer(&deadline);
        let overtime = timer.as_ref().map(|(_, flag)| Arc::clone(flag));
        let op = Box::new(ReadOp {
            sock: self.clone(),
            buf,
            got: 0,
            some,
            probe: self.pre_option(),
            overtime,
            timer: timer.map(|(t, _)| t),
            ntf: Some(ntf),
        });
        let strand = self.inner.strand.clone();
        strand.distribute(move || op.step());
    }

    fn start_write(
        &self,
        buf: Vec<u8>,
        some: bool,
        deadline: Option<(AsyncTimer, u64)>,
        ntf: IoNotify,
    ) {
        let timer = self.arm_shutdown_timer(&deadline);
        let overtime = timer.as_ref().map(|(_, flag)| Arc::clone(flag));
        let op = Box::new(WriteOp {
            sock: self.clone(),
            buf,
            sent: 0,
            some,
            probe: self.pre_option(),
            overtime,
            timer: timer.map(|(t, _)| t),
            ntf: Some(ntf),
        });
        let strand = self.inner.strand.clone();
        strand.distribute(move || op.step());
    }

    /// Arm a timer that marks the op overtime and shuts the socket
    /// down, forcing the pending syscall path to complete
    fn arm_shutdown_timer(
        &self,
        deadline: &Option<(AsyncTimer, u64)>,
    ) -> Option<(AsyncTimer, Arc<AtomicBool>)> {
        let (timer, ms) = match deadline {
            Some((timer, ms)) => (timer.clone(), *ms),
            None => return None,
        };
        debug_assert!(timer.strand() == &self.inner.strand);
        let flag = Arc::new(AtomicBool::new(false));
        let sock = self.clone();
        let set = Arc::clone(&flag);
        timer.timeout(ms, move || {
            set.store(true, Ordering::Release);
            sock.shutdown_both();
        });
        Some((timer, flag))
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("fd", &self.inner.io.as_raw_fd())
            .field("strand", &self.inner.strand.id())
            .finish()
    }
}

fn finish_connect(owned: OwnedFd, strand: &Strand, poller: &Poller) -> io::Result<TcpSocket> {
    let stream = unsafe { TcpStream::from_raw_fd(owned.into_raw_fd()) };
    TcpSocket::from_std(stream, strand, poller)
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

struct ReadOp {
    sock: TcpSocket,
    buf: Vec<u8>,
    got: usize,
    some: bool,
    probe: bool,
    overtime: Option<Arc<AtomicBool>>,
    timer: Option<AsyncTimer>,
    ntf: Option<IoNotify>,
}

impl ReadOp {
    fn step(mut self: Box<Self>) {
        debug_assert!(self.sock.inner.strand.running_in_this_thread());
        if self.buf.is_empty() {
            return self.finish(0, true);
        }
        loop {
            if !self.probe {
                self.probe = true;
                return self.park();
            }
            let fd = self.sock.inner.io.as_raw_fd();
            let r = sys_recv(fd, &mut self.buf[self.got..]);
            if r.ok {
                if r.bytes == 0 {
                    // End of stream (or the timeout shut us down)
                    return self.finish(0, false);
                }
                self.got += r.bytes;
                if self.some || self.got >= self.buf.len() {
                    return self.finish(0, true);
                }
                continue;
            }
            if r.code == libc::EINTR {
                continue;
            }
            if r.code == libc::EAGAIN || r.code == libc::EWOULDBLOCK {
                return self.park();
            }
            return self.finish(r.code, false);
        }
    }

    fn park(self: Box<Self>) {
        let strand = self.sock.inner.strand.clone();
        let poller = self.sock.inner.poller.clone();
        let fd = self.sock.inner.io.as_raw_fd();
        let this = self;
        poller.watch(
            fd,
            Interest::Read,
            Box::new(move |_failed| {
                strand.post(move || this.step());
            }),
        );
    }

    fn finish(mut self: Box<Self>, code: i32, ok: bool) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
        let timed_out = self
            .overtime
            .as_ref()
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false);
        let result = IoResult {
            bytes: self.got,
            code: if timed_out { libc::ETIMEDOUT } else { code },
            ok: ok && !timed_out,
        };
        let ntf = self.ntf.take().unwrap();
        let buf = std::mem::take(&mut self.buf);
        ntf(buf, result);
    }
}

struct WriteOp {
    sock: TcpSocket,
    buf: Vec<u8>,
    sent: usize,
    some: bool,
    probe: bool,
    overtime: Option<Arc<AtomicBool>>,
    timer: Option<AsyncTimer>,
    ntf: Option<IoNotify>,
}

impl WriteOp {
    fn step(mut self: Box<Self>) {
        debug_assert!(self.sock.inner.strand.running_in_this_thread());
        if self.buf.is_empty() {
            return self.finish(0, true);
        }
        loop {
            if !self.probe {
                self.probe = true;
                return self.park();
            }
            let fd = self.sock.inner.io.as_raw_fd();
            let r = sys_send(fd, &self.buf[self.sent..]);
            if r.ok {
                self.sent += r.bytes;
                if self.some || self.sent >= self.buf.len() {
                    return self.finish(0, true);
                }
                continue;
            }
            if r.code == libc::EINTR {
                continue;
            }
            if r.code == libc::EAGAIN || r.code == libc::EWOULDBLOCK {
                return self.park();
            }
            return self.finish(r.code, false);
        }
    }

    fn park(self: Box<Self>) {
        let strand = self.sock.inner.strand.clone();
        let poller = self.sock.inner.poller.clone();
        let fd = self.sock.inner.io.as_raw_fd();
        let this = self;
        poller.watch(
            fd,
            Interest::Write,
            Box::new(move |_failed| {
                strand.post(move || this.step());
            }),
        );
    }

    fn finish(mut self: Box<Self>, code: i32, ok: bool) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
        let timed_out = self
            .overtime
            .as_ref()
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false);
        let result = IoResult {
            bytes: self.sent,
            code: if timed_out { libc::ETIMEDOUT } else { code },
            ok: ok && !timed_out,
        };
        let ntf = self.ntf.take().unwrap();
        let buf = std::mem::take(&mut self.buf);
        ntf(buf, result);
    }
}

struct AcceptorInner {
    io: TcpListener,
    strand: Strand,
    poller: Poller,
}

impl Drop for AcceptorInner {
    fn drop(&mut self) {
        self.poller.unwatch(self.io.as_raw_fd());
    }
}

/// Handle to a strand-bound listener. Clones share the acceptor.
#[derive(Clone)]
pub struct TcpAcceptor {
    inner: Arc<AcceptorInner>,
}

impl TcpAcceptor {
    /// Bind and listen, non-blocking
    pub fn bind(strand: &Strand, poller: &Poller, addr: SocketAddr) -> io::Result<Self> {
        let io = TcpListener::bind(addr)?;
        io.set_nonblocking(true)?;
        Ok(Self {
            inner: Arc::new(AcceptorInner {
                io,
                strand: strand.clone(),
                poller: poller.clone(),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.io.local_addr()
    }

    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Accept one connection; the new socket is bound to `conn_strand`
    pub fn accept<N>(&self, conn_strand: &Strand, ntf: N)
    where
        N: FnOnce(io::Result<TcpSocket>) + Send + 'static,
    {
        self.start_accept(conn_strand, None, Box::new(ntf));
    }

    /// Accept with a deadline; `ETIMEDOUT` if nothing arrives in time
    pub fn timed_accept<N>(&self, timer: &AsyncTimer, ms: u64, conn_strand: &Strand, ntf: N)
    where
        N: FnOnce(io::Result<TcpSocket>) + Send + 'static,
    {
        self.start_accept(conn_strand, Some((timer.clone(), ms)), Box::new(ntf));
    }

    /// One non-blocking accept; `Ok(None)` when nothing is pending
    pub fn try_accept(&self, conn_strand: &Strand) -> io::Result<Option<TcpSocket>> {
        match self.inner.io.accept() {
            Ok((stream, _peer)) => {
                TcpSocket::from_std(stream, conn_strand, &self.inner.poller).map(Some)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn start_accept(
        &self,
        conn_strand: &Strand,
        deadline: Option<(AsyncTimer, u64)>,
        ntf: Box<dyn FnOnce(io::Result<TcpSocket>) + Send>,
    ) {
        let overtime = Arc::new(AtomicBool::new(false));
        let timer = deadline.map(|(timer, ms)| {
            debug_assert!(timer.strand() == &self.inner.strand);
            let flag = Arc::clone(&overtime);
            let poller = self.inner.poller.clone();
            let fd = self.inner.io.as_raw_fd();
            timer.timeout(ms, move || {
                flag.store(true, Ordering::Release);
                poller.kick(fd);
            });
            timer
        });

        let op = Box::new(AcceptOp {
            acc: self.clone(),
            conn_strand: conn_strand.clone(),
            overtime,
            timer,
            ntf: Some(ntf),
        });
        let strand = self.inner.strand.clone();
        strand.distribute(move || op.step());
    }
}

struct AcceptOp {
    acc: TcpAcceptor,
    conn_strand: Strand,
    overtime: Arc<AtomicBool>,
    timer: Option<AsyncTimer>,
    ntf: Option<Box<dyn FnOnce(io::Result<TcpSocket>) + Send>>,
}

impl AcceptOp {
    fn step(mut self: Box<Self>) {
        debug_assert!(self.acc.inner.strand.running_in_this_thread());
        loop {
            if self.overtime.load(Ordering::Acquire) {
                return self.finish(Err(io::Error::from_raw_os_error(libc::ETIMEDOUT)));
            }
            match self.acc.inner.io.accept() {
                Ok((stream, _peer)) => {
                    let sock = TcpSocket::from_std(stream, &self.conn_strand, &self.acc.inner.poller);
                    return self.finish(sock);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let strand = self.acc.inner.strand.clone();
                    let poller = self.acc.inner.poller.clone();
                    let fd = self.acc.inner.io.as_raw_fd();
                    let this = self;
                    poller.watch(
                        fd,
                        Interest::Read,
                        Box::new(move |_failed| {
                            strand.post(move || this.step());
                        }),
                    );
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.finish(Err(e)),
            }
        }
    }

    fn finish(mut self: Box<Self>, result: io::Result<TcpSocket>) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
        let ntf = self.ntf.take().unwrap();
        ntf(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costrand_runtime::pool::IoPool;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn setup() -> (IoPool, Poller, Strand) {
        let pool = IoPool::new(2).unwrap();
        let poller = Poller::start().unwrap();
        let strand = pool.strand();
        (pool, poller, strand)
    }

    fn connected_pair(
        pool: &IoPool,
        poller: &Poller,
        strand: &Strand,
    ) -> (TcpSocket, TcpSocket) {
        let acc = TcpAcceptor::bind(strand, poller, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acc.local_addr().unwrap();

        let (stx, srx) = mpsc::channel();
        acc.accept(&pool.strand(), move |res| {
            stx.send(res.unwrap()).unwrap();
        });

        let (ctx, crx) = mpsc::channel();
        TcpSocket::connect(strand, poller, addr, move |res| {
            ctx.send(res.unwrap()).unwrap();
        });

        let server = srx.recv_timeout(Duration::from_secs(5)).unwrap();
        let client = crx.recv_timeout(Duration::from_secs(5)).unwrap();
        (server, client)
    }

    #[test]
    fn test_connect_write_read_round_trip() {
        let (pool, poller, strand) = setup();
        let (server, client) = connected_pair(&pool, &poller, &strand);
        let (tx, rx) = mpsc::channel();

        client.write(b"ping".to_vec(), |_, r| assert!(r.ok));
        server.read(vec![0u8; 4], move |buf, r| {
            tx.send((buf, r)).unwrap();
        });

        let (buf, r) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(r.ok);
        assert_eq!(r.bytes, 4);
        assert_eq!(&buf, b"ping");

        poller.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_timed_read_reports_partial_progress() {
        let (pool, poller, strand) = setup();
        let (server, client) = connected_pair(&pool, &poller, &strand);
        let timer = AsyncTimer::new(&strand);
        let (tx, rx) = mpsc::channel();

        // Ask for 4 bytes with a 50ms budget; only 2 ever arrive.
        let start = Instant::now();
        server.timed_read(&timer, 50, vec![0u8; 4], move |buf, r| {
            tx.send((buf, r, start.elapsed())).unwrap();
        });

        std::thread::sleep(Duration::from_millis(10));
        client.write(b"ab".to_vec(), |_, r| assert!(r.ok));

        let (buf, r, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!r.ok);
        assert_eq!(r.bytes, 2);
        assert_eq!(r.code, libc::ETIMEDOUT);
        assert_eq!(&buf[..2], b"ab");
        assert!(elapsed >= Duration::from_millis(50));

        poller.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_try_paths() {
        let (pool, poller, strand) = setup();
        let (server, client) = connected_pair(&pool, &poller, &strand);

        // Nothing to read yet
        let mut buf = [0u8; 8];
        let r = server.try_read(&mut buf);
        assert!(!r.ok);
        assert!(r.would_block());

        let r = client.try_write(b"abc");
        assert!(r.ok);
        assert_eq!(r.bytes, 3);

        // Data needs a moment to cross loopback
        std::thread::sleep(Duration::from_millis(50));
        let r = server.try_read(&mut buf);
        assert!(r.ok);
        assert_eq!(r.bytes, 3);
        assert_eq!(&buf[..3], b"abc");

        poller.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_vectored_write() {
        let (pool, poller, strand) = setup();
        let (server, client) = connected_pair(&pool, &poller, &strand);
        let (tx, rx) = mpsc::channel();

        let r = client.try_write_vectored(&[b"he", b"llo"]);
        assert!(r.ok);
        assert_eq!(r.bytes, 5);

        server.read(vec![0u8; 5], move |buf, r| tx.send((buf, r)).unwrap());
        let (buf, r) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(r.ok);
        assert_eq!(&buf, b"hello");

        poller.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_send_chunks_counts_buffers() {
        let (pool, poller, strand) = setup();
        let (server, client) = connected_pair(&pool, &poller, &strand);
        let (tx, rx) = mpsc::channel();

        let (r, last) = client.try_send_chunks(&[b"ab", b"cd", b"ef"]);
        assert!(r.ok);
        assert_eq!(r.bytes, 3); // three full buffers
        assert_eq!(last, 2); // last buffer fully sent

        server.read(vec![0u8; 6], move |buf, r| tx.send((buf, r)).unwrap());
        let (buf, r) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(r.ok);
        assert_eq!(&buf, b"abcdef");

        poller.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_timed_accept_times_out() {
        let (pool, poller, strand) = setup();
        let acc = TcpAcceptor::bind(&strand, &poller, "127.0.0.1:0".parse().unwrap()).unwrap();
        let timer = AsyncTimer::new(&strand);
        let (tx, rx) = mpsc::channel();

        acc.timed_accept(&timer, 30, &pool.strand(), move |res| {
            tx.send(res.err().map(|e| e.raw_os_error())).unwrap();
        });

        let err = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(err, Some(Some(libc::ETIMEDOUT)));

        poller.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_read_eof_reports_not_ok() {
        let (pool, poller, strand) = setup();
        let (server, client) = connected_pair(&pool, &poller, &strand);
        let (tx, rx) = mpsc::channel();

        server.read(vec![0u8; 4], move |_, r| tx.send(r).unwrap());
        drop(client);

        let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!r.ok);
        assert_eq!(r.bytes, 0);

        poller.shutdown();
        pool.shutdown();
    }
}
