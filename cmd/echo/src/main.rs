//! Generator-driven TCP echo server.
//!
//! One acceptor generator loops on `accept`; every connection gets its
//! own strand and its own echo generator that shuttles bytes back until
//! the peer hangs up.
//!
//! ```text
//! cargo run -p echo [addr]        # default 127.0.0.1:7777
//! printf hello | nc 127.0.0.1 7777
//! ```

use costrand::{cinfo, co_await, AsyncResult, Co, Gen, IoPool, Step};
use costrand_net::{IoResult, Poller, TcpAcceptor, TcpSocket};

fn main() {
    let addr: std::net::SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7777".to_string())
        .parse()
        .expect("listen address");

    let pool = IoPool::new(4).expect("pool");
    let poller = Poller::start().expect("poller");
    let strand = pool.strand();

    let acceptor = TcpAcceptor::bind(&strand, &poller, addr).expect("bind");
    cinfo!("echo listening on {}", acceptor.local_addr().unwrap());

    #[derive(Clone)]
    struct AcceptCtx {
        acceptor: TcpAcceptor,
        pool: IoPool,
        conn: AsyncResult<std::io::Result<TcpSocket>>,
    }

    Gen::create(
        &strand,
        AcceptCtx {
            acceptor: acceptor.clone(),
            pool: pool.clone(),
            conn: AsyncResult::new(),
        },
        |co, cx| loop {
            match co.pc() {
                0 => {
                    let conn_strand = cx.pool.strand();
                    cx.acceptor.accept(&conn_strand, co.value_notify(&cx.conn));
                    co_await!(co => 1);
                }
                1 => {
                    match cx.conn.take_value().unwrap() {
                        Ok(sock) => spawn_echo(sock),
                        Err(e) => {
                            cinfo!("accept failed: {}", e);
                            return Step::Done;
                        }
                    }
                    co.jump(0);
                }
                _ => unreachable!(),
            }
        },
    )
    .run();

    // Serve until killed.
    loop {
        std::thread::park();
    }
}

fn spawn_echo(sock: TcpSocket) {
    #[derive(Clone)]
    struct EchoCtx {
        sock: TcpSocket,
        io: AsyncResult<(Vec<u8>, IoResult)>,
    }

    let strand = sock.strand().clone();
    Gen::create(
        &strand,
        EchoCtx {
            sock,
            io: AsyncResult::new(),
        },
        |co: &mut Co, cx: &mut EchoCtx| loop {
            match co.pc() {
                0 => {
                    let ntf = co.value_notify(&cx.io);
                    cx.sock
                        .read_some(vec![0u8; 4096], move |buf, r| ntf((buf, r)));
                    co_await!(co => 1);
                }
                1 => {
                    let (mut buf, r) = cx.io.take_value().unwrap();
                    if !r.ok || r.bytes == 0 {
                        return Step::Done;
                    }
                    buf.truncate(r.bytes);
                    let ntf = co.value_notify(&cx.io);
                    cx.sock.write(buf, move |buf, r| ntf((buf, r)));
                    co_await!(co => 2);
                }
                2 => {
                    let (_, r) = cx.io.take_value().unwrap();
                    if !r.ok {
                        return Step::Done;
                    }
                    co.jump(0);
                }
                _ => unreachable!(),
            }
        },
    )
    .run();
}
