//! # costrand-net
//!
//! Strand-bound sockets for the costrand actor runtime: an epoll-based
//! readiness poller plus TCP/UDP wrappers whose operations run and
//! complete on the socket's strand.
//!
//! Operation shape: completions carry `IoResult { bytes, code, ok }`
//! where `code` is the raw OS errno (`ETIMEDOUT` when a timed
//! operation's timer won). Timed operations resolve the race by
//! closing down the resource: the timer shuts the socket (or kicks the
//! poller), forcing the pending operation to complete with whatever it
//! transferred so far.
//!
//! ## Modules
//!
//! - `poller` - epoll reactor thread, one-shot fd callbacks
//! - `tcp` - `TcpSocket`, `TcpAcceptor`
//! - `udp` - `UdpSocket` with `sendmmsg`/`recvmmsg` batch ops

pub mod poller;
mod sysio;
pub mod tcp;
pub mod udp;

pub use poller::{Interest, Poller};
pub use tcp::{TcpAcceptor, TcpSocket};
pub use udp::UdpSocket;

/// Result of a socket operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoResult {
    /// Bytes transferred (buffers, for the mmsg batch ops)
    pub bytes: usize,

    /// Raw OS error code; 0 when none. `ETIMEDOUT` marks a timed
    /// operation cut short by its timer.
    pub code: i32,

    /// Operation completed normally
    pub ok: bool,
}

impl IoResult {
    /// Successful completion
    pub fn done(bytes: usize) -> Self {
        Self {
            bytes,
            code: 0,
            ok: true,
        }
    }

    /// Failed completion with an errno
    pub fn error(code: i32) -> Self {
        Self {
            bytes: 0,
            code,
            ok: false,
        }
    }

    /// The operation would have blocked
    pub fn would_block(&self) -> bool {
        !self.ok && (self.code == libc::EAGAIN || self.code == libc::EWOULDBLOCK)
    }

    /// A timed operation's deadline fired first
    pub fn timed_out(&self) -> bool {
        self.code == libc::ETIMEDOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costrand::{co_await, AsyncResult, Gen, IoPool, Step};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_io_result_predicates() {
        assert!(IoResult::done(4).ok);
        assert!(IoResult::error(libc::EAGAIN).would_block());
        assert!(!IoResult::error(libc::ECONNRESET).would_block());
        assert!(IoResult::error(libc::ETIMEDOUT).timed_out());
    }

    // A generator-driven echo hop: the server generator reads four
    // bytes and writes them back; the client writes then reads.
    #[test]
    fn test_generator_echo() {
        let pool = IoPool::new(2).unwrap();
        let poller = Poller::start().unwrap();
        let strand = pool.strand();

        let acc =
            TcpAcceptor::bind(&strand, &poller, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acc.local_addr().unwrap();

        let (stx, srx) = mpsc::channel();
        acc.accept(&pool.strand(), move |res| {
            stx.send(res.unwrap()).unwrap();
        });

        let (ctx_tx, ctx_rx) = mpsc::channel();
        TcpSocket::connect(&strand, &poller, addr, move |res| {
            ctx_tx.send(res.unwrap()).unwrap();
        });

        let server = srx.recv_timeout(Duration::from_secs(5)).unwrap();
        let client = ctx_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        #[derive(Clone)]
        struct EchoCtx {
            sock: TcpSocket,
            io: AsyncResult<(Vec<u8>, IoResult)>,
        }

        let echo = Gen::create(
            server.strand(),
            EchoCtx {
                sock: server.clone(),
                io: AsyncResult::new(),
            },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        let ntf = co.value_notify(&cx.io);
                        cx.sock.read(vec![0u8; 4], move |buf, r| ntf((buf, r)));
                        co_await!(co => 1);
                    }
                    1 => {
                        let (buf, r) = cx.io.take_value().unwrap();
                        if !r.ok {
                            return Step::Done;
                        }
                        let ntf = co.value_notify(&cx.io);
                        cx.sock.write(buf, move |buf, r| ntf((buf, r)));
                        co_await!(co => 2);
                    }
                    2 => {
                        let (_, r) = cx.io.take_value().unwrap();
                        assert!(r.ok);
                        return Step::Done;
                    }
                    _ => unreachable!(),
                }
            },
        );
        echo.run();

        let (tx, rx) = mpsc::channel();
        client.write(b"ping".to_vec(), |_, r| assert!(r.ok));
        client.read(vec![0u8; 4], move |buf, r| {
            tx.send((buf, r)).unwrap();
        });

        let (buf, r) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(r.ok);
        assert_eq!(&buf, b"ping");

        poller.shutdown();
        pool.shutdown();
    }
}
