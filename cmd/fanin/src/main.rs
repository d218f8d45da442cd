//! Fan-in: N producer generators, each on its own strand, push their id
//! onto one bounded channel; a single consumer drains them all.
//!
//! ```text
//! cargo run -p fanin [producers]
//! ```

use costrand::{co_chan_pop, co_chan_push, AsyncResult, Chan, Gen, IoPool, Step};

use std::sync::mpsc;
use std::time::Instant;

fn main() {
    let producers: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    let pool = IoPool::new(4).expect("pool");
    let consumer_strand = pool.strand();
    let chan: Chan<usize> = Chan::new(&consumer_strand, 10);
    let (done_tx, done_rx) = mpsc::channel();

    #[derive(Clone)]
    struct Producer {
        chan: Chan<usize>,
        id: usize,
        st: AsyncResult<()>,
    }

    let start = Instant::now();
    for id in 0..producers {
        let strand = pool.strand();
        Gen::create(
            &strand,
            Producer {
                chan: chan.clone(),
                id,
                st: AsyncResult::new(),
            },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        let id = cx.id;
                        co_chan_push!(co, cx.chan, cx.st, id => 1);
                    }
                    1 => return Step::Done,
                    _ => unreachable!(),
                }
            },
        )
        .run();
    }

    #[derive(Clone)]
    struct Consumer {
        chan: Chan<usize>,
        got: AsyncResult<usize>,
        remaining: usize,
        sum: usize,
        done: mpsc::Sender<usize>,
    }

    Gen::create(
        &consumer_strand,
        Consumer {
            chan,
            got: AsyncResult::new(),
            remaining: producers,
            sum: 0,
            done: done_tx,
        },
        |co, cx| loop {
            match co.pc() {
                0 => {
                    co_chan_pop!(co, cx.chan, cx.got => 1);
                }
                1 => {
                    let (_, value) = cx.got.take();
                    cx.sum += value.unwrap();
                    cx.remaining -= 1;
                    if cx.remaining == 0 {
                        cx.done.send(cx.sum).unwrap();
                        return Step::Done;
                    }
                    co.jump(0);
                }
                _ => unreachable!(),
            }
        },
    )
    .run();

    let sum = done_rx.recv().expect("consumer finished");
    let expected = producers * (producers - 1) / 2;
    println!(
        "{} producers drained in {:?}, sum {} (expected {})",
        producers,
        start.elapsed(),
        sum,
        expected
    );
    assert_eq!(sum, expected);

    pool.shutdown();
}
