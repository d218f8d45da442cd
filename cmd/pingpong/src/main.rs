//! Ping-pong: two generators on two strands bounce a counter through a
//! pair of channels for a configurable number of rounds.
//!
//! ```text
//! cargo run -p pingpong [rounds]
//! ```

use costrand::{co_chan_pop, co_chan_push, AsyncResult, Chan, Gen, IoPool, Step};

use std::sync::mpsc;
use std::time::Instant;

fn main() {
    let rounds: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000);

    let pool = IoPool::new(2).expect("pool");
    let sa = pool.strand();
    let sb = pool.strand();
    let ping: Chan<u64> = Chan::new(&sa, 1);
    let pong: Chan<u64> = Chan::new(&sb, 1);
    let (done_tx, done_rx) = mpsc::channel();

    #[derive(Clone)]
    struct Ctx {
        ping: Chan<u64>,
        pong: Chan<u64>,
        st: AsyncResult<()>,
        got: AsyncResult<u64>,
        rounds: u64,
        done: mpsc::Sender<u64>,
    }

    // Each generator carries its own result cells.
    let server_ctx = Ctx {
        ping: ping.clone(),
        pong: pong.clone(),
        st: AsyncResult::new(),
        got: AsyncResult::new(),
        rounds,
        done: done_tx.clone(),
    };
    let driver_ctx = Ctx {
        ping: ping.clone(),
        pong: pong.clone(),
        st: AsyncResult::new(),
        got: AsyncResult::new(),
        rounds,
        done: done_tx,
    };

    // Serves: pop ping, push the value back on pong.
    let server = Gen::create(&sb, server_ctx, |co, cx| loop {
        match co.pc() {
            0 => {
                co_chan_pop!(co, cx.ping, cx.got => 1);
            }
            1 => {
                let (state, value) = cx.got.take();
                if !state.is_ok() {
                    return Step::Done;
                }
                let v = value.unwrap();
                co_chan_push!(co, cx.pong, cx.st, v => 2);
            }
            2 => {
                if !cx.st.state().is_ok() {
                    return Step::Done;
                }
                co.jump(0);
            }
            _ => unreachable!(),
        }
    });

    // Drives: push a counter, pop it back, repeat.
    let driver = Gen::create(&sa, driver_ctx, |co, cx| loop {
        match co.pc() {
            0 => {
                let n = cx.rounds;
                co_chan_push!(co, cx.ping, cx.st, n => 1);
            }
            1 => {
                co_chan_pop!(co, cx.pong, cx.got => 2);
            }
            2 => {
                let (_, value) = cx.got.take();
                let v = value.unwrap();
                cx.rounds -= 1;
                if cx.rounds == 0 {
                    cx.done.send(v).unwrap();
                    cx.ping.close();
                    return Step::Done;
                }
                co.jump(0);
            }
            _ => unreachable!(),
        }
    });

    let start = Instant::now();
    server.run();
    driver.run();

    let last = done_rx.recv().expect("driver finished");
    let elapsed = start.elapsed();
    println!(
        "{} round trips in {:?} ({:.0} ns/round), last value {}",
        rounds,
        elapsed,
        elapsed.as_nanos() as f64 / rounds as f64,
        last
    );

    pool.shutdown();
}
