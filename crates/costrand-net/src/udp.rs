//! Strand-bound UDP sockets
//!
//! Datagram ops complete in a single syscall, so the wait-style
//! variants are one "try then register" round per datagram. Multi-
//! message batching goes through `sendmmsg`/`recvmmsg` with the same
//! partial-progress accounting as the TCP chunk ops.

use crate::poller::{Interest, Poller};
use crate::sysio::{sys_recvmmsg, sys_sendmmsg};
use crate::IoResult;

use costrand_runtime::strand::Strand;
use costrand_runtime::timer::AsyncTimer;

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Completion notify for receive ops: buffer, result, and the sender's
/// address when known
pub type UdpRecvNotify = Box<dyn FnOnce(Vec<u8>, IoResult, Option<SocketAddr>) + Send>;

/// Completion notify for send ops
pub type UdpSendNotify = Box<dyn FnOnce(Vec<u8>, IoResult) + Send>;

struct UdpInner {
    io: std::net::UdpSocket,
    strand: Strand,
    poller: Poller,
    pre_option: AtomicBool,
}

impl Drop for UdpInner {
    fn drop(&mut self) {
        self.poller.unwatch(self.io.as_raw_fd());
    }
}

/// Handle to a strand-bound UDP socket. Clones share the socket.
#[derive(Clone)]
pub struct UdpSocket {
    inner: Arc<UdpInner>,
}

impl UdpSocket {
    /// Bind, non-blocking
    pub fn bind(strand: &Strand, poller: &Poller, addr: SocketAddr) -> io::Result<Self> {
        let io = std::net::UdpSocket::bind(addr)?;
        io.set_nonblocking(true)?;
        Ok(Self {
            inner: Arc::new(UdpInner {
                io,
                strand: strand.clone(),
                poller: poller.clone(),
                pre_option: AtomicBool::new(true),
            }),
        })
    }

    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.io.local_addr()
    }

    /// Fix the peer for `send`/`recv`
    pub fn connect_peer(&self, addr: SocketAddr) -> io::Result<()> {
        self.inner.io.connect(addr)
    }

    pub fn set_pre_option(&self, enabled: bool) {
        self.inner.pre_option.store(enabled, Ordering::Relaxed);
    }

    pub fn pre_option(&self) -> bool {
        self.inner.pre_option.load(Ordering::Relaxed)
    }

    /// Send one datagram to `addr`
    pub fn send_to<N>(&self, buf: Vec<u8>, addr: SocketAddr, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult) + Send + 'static,
    {
        self.start_send(buf, Some(addr), None, Box::new(ntf));
    }

    /// Send one datagram to the connected peer
    pub fn send<N>(&self, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult) + Send + 'static,
    {
        self.start_send(buf, None, None, Box::new(ntf));
    }

    /// `send_to` with a deadline
    pub fn timed_send_to<N>(
        &self,
        timer: &AsyncTimer,
        ms: u64,
        buf: Vec<u8>,
        addr: SocketAddr,
        ntf: N,
    ) where
        N: FnOnce(Vec<u8>, IoResult) + Send + 'static,
    {
        self.start_send(buf, Some(addr), Some((timer.clone(), ms)), Box::new(ntf));
    }

    /// Receive one datagram, reporting the sender
    pub fn recv_from<N>(&self, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult, Option<SocketAddr>) + Send + 'static,
    {
        self.start_recv(buf, true, None, Box::new(ntf));
    }

    /// Receive one datagram from the connected peer
    pub fn recv<N>(&self, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult, Option<SocketAddr>) + Send + 'static,
    {
        self.start_recv(buf, false, None, Box::new(ntf));
    }

    /// `recv_from` with a deadline; `ETIMEDOUT` when nothing arrives
    pub fn timed_recv_from<N>(&self, timer: &AsyncTimer, ms: u64, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult, Option<SocketAddr>) + Send + 'static,
    {
        self.start_recv(buf, true, Some((timer.clone(), ms)), Box::new(ntf));
    }

    /// `recv` with a deadline
    pub fn timed_recv<N>(&self, timer: &AsyncTimer, ms: u64, buf: Vec<u8>, ntf: N)
    where
        N: FnOnce(Vec<u8>, IoResult, Option<SocketAddr>) + Send + 'static,
    {
        self.start_recv(buf, false, Some((timer.clone(), ms)), Box::new(ntf));
    }

    /// One non-blocking send to the connected peer
    pub fn try_send(&self, data: &[u8]) -> IoResult {
        map_io(self.inner.io.send(data))
    }

    /// One non-blocking send_to
    pub fn try_send_to(&self, data: &[u8], addr: SocketAddr) -> IoResult {
        map_io(self.inner.io.send_to(data, addr))
    }

    /// One non-blocking recv from the connected peer
    pub fn try_recv(&self, buf: &mut [u8]) -> IoResult {
        map_io(self.inner.io.recv(buf))
    }

    /// One non-blocking recv_from
    pub fn try_recv_from(&self, buf: &mut [u8]) -> (IoResult, Option<SocketAddr>) {
        match self.inner.io.recv_from(buf) {
            Ok((n, addr)) => (IoResult::done(n), Some(addr)),
            Err(e) => (IoResult::error(e.raw_os_error().unwrap_or(0)), None),
        }
    }

    /// Batch send via sendmmsg(2), one datagram per buffer: `bytes`
    /// counts datagrams sent, the second value the bytes of the last
    pub fn try_send_mmsg(&self, chunks: &[&[u8]]) -> (IoResult, usize) {
        sys_sendmmsg(self.inner.io.as_raw_fd(), chunks, 0)
    }

    /// Batch receive via recvmmsg(2), one datagram per buffer
    pub fn try_recv_mmsg(&self, bufs: &mut [&mut [u8]]) -> (IoResult, usize) {
        sys_recvmmsg(self.inner.io.as_raw_fd(), bufs, 0)
    }

    fn start_send(
        &self,
        buf: Vec<u8>,
        addr: Option<SocketAddr>,
        deadline: Option<(AsyncTimer, u64)>,
        ntf: UdpSendNotify,
    ) {
        let (timer, overtime) = self.arm_kick_timer(deadline);
        let op = Box::new(UdpSendOp {
            sock: self.clone(),
            buf,
            addr,
            probe: self.pre_option(),
            overtime,
            timer,
            ntf: Some(ntf),
        });
        let strand = self.inner.strand.clone();
        strand.distribute(move || op.step());
    }

    fn start_recv(
        &self,
        buf: Vec<u8>,
        with_addr: bool,
        deadline: Option<(AsyncTimer, u64)>,
        ntf: UdpRecvNotify,
    ) {
        let (timer, overtime) = self.arm_kick_timer(deadline);
        let op = Box::new(UdpRecvOp {
            sock: self.clone(),
            buf,
            with_addr,
            probe: self.pre_option(),
            overtime,
            timer,
            ntf: Some(ntf),
        });
        let strand = self.inner.strand.clone();
        strand.distribute(move || op.step());
    }

    /// Timeout path for datagram ops: mark overtime and kick the
    /// poller so the parked op observes the flag
    fn arm_kick_timer(
        &self,
        deadline: Option<(AsyncTimer, u64)>,
    ) -> (Option<AsyncTimer>, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let timer = deadline.map(|(timer, ms)| {
            debug_assert!(timer.strand() == &self.inner.strand);
            let set = Arc::clone(&flag);
            let poller = self.inner.poller.clone();
            let fd = self.inner.io.as_raw_fd();
            timer.timeout(ms, move || {
                set.store(true, Ordering::Release);
                poller.kick(fd);
            });
            timer
        });
        (timer, flag)
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("fd", &self.inner.io.as_raw_fd())
            .field("strand", &self.inner.strand.id())
            .finish()
    }
}

fn map_io(res: io::Result<usize>) -> IoResult {
    match res {
        Ok(n) => IoResult::done(n),
        Err(e) => IoResult::error(e.raw_os_error().unwrap_or(0)),
    }
}

struct UdpSendOp {
    sock: UdpSocket,
    buf: Vec<u8>,
    addr: Option<SocketAddr>,
    probe: bool,
    overtime: Arc<AtomicBool>,
    timer: Option<AsyncTimer>,
    ntf: Option<UdpSendNotify>,
}

impl UdpSendOp {
    fn step(mut self: Box<Self>) {
        debug_assert!(self.sock.inner.strand.running_in_this_thread());
        loop {
            if self.overtime.load(Ordering::Acquire) {
                return self.finish(IoResult::error(libc::ETIMEDOUT));
            }
            if !self.probe {
                self.probe = true;
                return self.park();
            }
            let r = match self.addr {
                Some(addr) => self.sock.try_send_to(&self.buf, addr),
                None => self.sock.try_send(&self.buf),
            };
            if r.ok {
                return self.finish(r);
            }
            if r.code == libc::EINTR {
                continue;
            }
            if r.would_block() {
                return self.park();
            }
            return self.finish(r);
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

    fn finish(mut self: Box<Self>, result: IoResult) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
        let ntf = self.ntf.take().unwrap();
        let buf = std::mem::take(&mut self.buf);
        ntf(buf, result);
    }
}

struct UdpRecvOp {
    sock: UdpSocket,
    buf: Vec<u8>,
    with_addr: bool,
    probe: bool,
    overtime: Arc<AtomicBool>,
    timer: Option<AsyncTimer>,
    ntf: Option<UdpRecvNotify>,
}

impl UdpRecvOp {
    fn step(mut self: Box<Self>) {
        debug_assert!(self.sock.inner.strand.running_in_this_thread());
        loop {
            if self.overtime.load(Ordering::Acquire) {
                return self.finish(IoResult::error(libc::ETIMEDOUT), None);
            }
            if !self.probe {
                self.probe = true;
                return self.park();
            }
            let (r, addr) = if self.with_addr {
                let mut buf = std::mem::take(&mut self.buf);
                let out = self.sock.try_recv_from(&mut buf);
                self.buf = buf;
                out
            } else {
                let mut buf = std::mem::take(&mut self.buf);
                let r = self.sock.try_recv(&mut buf);
                self.buf = buf;
                (r, None)
            };
            if r.ok {
                return self.finish(r, addr);
            }
            if r.code == libc::EINTR {
                continue;
            }
            if r.would_block() {
                return self.park();
            }
            return self.finish(r, None);
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

    fn finish(mut self: Box<Self>, result: IoResult, addr: Option<SocketAddr>) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
        let ntf = self.ntf.take().unwrap();
        let buf = std::mem::take(&mut self.buf);
        ntf(buf, result, addr);
    }
}
