//! # costrand
//!
//! Actor-style concurrency runtime: programs are large populations of
//! lightweight cooperative tasks (stackless generators) that talk
//! through typed channels, serialize through strands, and compose
//! timeouts onto everything that waits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       User Code                             │
//! │         Gen bodies, Chan/NilChan/MsgBuffer, Select          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Strands                              │
//! │        FIFO serialization, one worker per strand            │
//! └─────────────────────────────────────────────────────────────┘
//!               │                            │
//!               ▼                            ▼
//!        ┌────────────┐               ┌────────────┐
//!        │   IoPool   │               │   Timer    │
//!        │  workers   │               │   thread   │
//!        └────────────┘               └────────────┘
//! ```
//!
//! Control flow: I/O readiness or a timer wakes a worker, the worker
//! drains a strand, a strand callback resumes a generator, the
//! generator runs to its next explicit suspension and parks a resume
//! notify with whatever it is waiting on.
//!
//! ## Quick start
//!
//! ```ignore
//! use costrand::{co_await, AsyncResult, Chan, Gen, IoPool, Step};
//!
//! let pool = IoPool::new(4)?;
//! let strand = pool.strand();
//! let chan: Chan<u32> = Chan::new(&strand, 10);
//!
//! #[derive(Clone)]
//! struct Ctx { chan: Chan<u32>, got: AsyncResult<u32> }
//!
//! let consumer = Gen::create(&strand, Ctx { chan: chan.clone(), got: AsyncResult::new() },
//!     |co, cx| loop {
//!         match co.pc() {
//!             0 => {
//!                 cx.chan.pop(co.result_notify(&cx.got));
//!                 co_await!(co => 1);
//!             }
//!             1 => {
//!                 let (state, value) = cx.got.take();
//!                 if !state.is_ok() { return Step::Done; }
//!                 println!("got {}", value.unwrap());
//!                 co.jump(0);
//!             }
//!             _ => unreachable!(),
//!         }
//!     });
//! consumer.run();
//! ```

pub mod chan;
pub mod comutex;
pub mod gen;
pub mod msgq;
pub mod nilchan;
pub mod notify;
pub mod select;

// The actor layer
pub use chan::Chan;
pub use comutex::CoMutex;
pub use gen::{AsyncResult, Co, Gen, Step, Suspend};
pub use msgq::MsgBuffer;
pub use nilchan::NilChan;
pub use select::{Select, SelectSource};

// Re-export the substrate
pub use costrand_core::{AsyncState, LogLevel, NotifySign, RtError, RtResult, SharedSign};
pub use costrand_runtime::{AsyncTimer, IoPool, PoolConfig, Strand, TimerQueue};

// Log macros live at the costrand-core crate root; pull them in so
// applications only depend on the facade.
pub use costrand_core::{cdebug, cerror, cinfo, clog, ctrace, cwarn};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    // Two generators on two strands sharing two channels: G1 pushes 1
    // onto `a` and pops `b`; G2 pops `a` and pushes the value plus one
    // onto `b`.
    #[test]
    fn test_ping_pong_across_strands() {
        let pool = IoPool::new(2).unwrap();
        let sa = pool.strand();
        let sb = pool.strand();
        let a: Chan<i32> = Chan::new(&sa, 1);
        let b: Chan<i32> = Chan::new(&sb, 1);
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Ping {
            a: Chan<i32>,
            b: Chan<i32>,
            st: AsyncResult<()>,
            got: AsyncResult<i32>,
            tx: mpsc::Sender<i32>,
        }

        let g1 = Gen::create(
            &sa,
            Ping {
                a: a.clone(),
                b: b.clone(),
                st: AsyncResult::new(),
                got: AsyncResult::new(),
                tx,
            },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        co_chan_push!(co, cx.a, cx.st, 1 => 1);
                    }
                    1 => {
                        assert!(cx.st.state().is_ok());
                        co_chan_pop!(co, cx.b, cx.got => 2);
                    }
                    2 => {
                        let (state, value) = cx.got.take();
                        assert!(state.is_ok());
                        cx.tx.send(value.unwrap()).unwrap();
                        return Step::Done;
                    }
                    _ => unreachable!(),
                }
            },
        );

        #[derive(Clone)]
        struct Pong {
            a: Chan<i32>,
            b: Chan<i32>,
            st: AsyncResult<()>,
            got: AsyncResult<i32>,
        }

        let g2 = Gen::create(
            &sb,
            Pong {
                a,
                b,
                st: AsyncResult::new(),
                got: AsyncResult::new(),
            },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        co_chan_pop!(co, cx.a, cx.got => 1);
                    }
                    1 => {
                        let (state, value) = cx.got.take();
                        assert!(state.is_ok());
                        let v = value.unwrap();
                        co_chan_push!(co, cx.b, cx.st, v + 1 => 2);
                    }
                    2 => return Step::Done,
                    _ => unreachable!(),
                }
            },
        );

        g1.run();
        g2.run();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        pool.shutdown();
    }

    // 100 producers each push their id onto a capacity-10 channel; one
    // consumer pops 100 times and must see every id exactly once.
    #[test]
    fn test_fan_in_hundred_producers() {
        let pool = IoPool::new(4).unwrap();
        let cs = pool.strand();
        let chan: Chan<usize> = Chan::new(&cs, 10);
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Producer {
            chan: Chan<usize>,
            id: usize,
            st: AsyncResult<()>,
        }

        for id in 0..100 {
            let strand = pool.strand();
            let gen = Gen::create(
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
                        1 => {
                            assert!(cx.st.state().is_ok());
                            return Step::Done;
                        }
                        _ => unreachable!(),
                    }
                },
            );
            gen.run();
        }

        #[derive(Clone)]
        struct Consumer {
            chan: Chan<usize>,
            got: AsyncResult<usize>,
            n: usize,
            tx: mpsc::Sender<usize>,
        }

        let consumer = Gen::create(
            &cs,
            Consumer {
                chan,
                got: AsyncResult::new(),
                n: 0,
                tx,
            },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        co_chan_pop!(co, cx.chan, cx.got => 1);
                    }
                    1 => {
                        let (state, value) = cx.got.take();
                        assert!(state.is_ok());
                        cx.tx.send(value.unwrap()).unwrap();
                        cx.n += 1;
                        if cx.n < 100 {
                            co.jump(0);
                            continue;
                        }
                        return Step::Done;
                    }
                    _ => unreachable!(),
                }
            },
        );
        consumer.run();

        let mut seen = HashSet::new();
        for _ in 0..100 {
            seen.insert(rx.recv_timeout(Duration::from_secs(10)).unwrap());
        }
        assert_eq!(seen, (0..100).collect::<HashSet<_>>());
        pool.shutdown();
    }

    // Select over two silent channels plus a 50ms timer case: the timer
    // case wins and the channel registrations are retracted.
    #[test]
    fn test_select_timeout_case_wins() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let c1: Chan<i32> = Chan::new(&strand, 1);
        let c2: Chan<i32> = Chan::new(&strand, 1);
        let tick: MsgBuffer<()> = MsgBuffer::new(&strand);
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Ctx {
            sel: Select,
            c1: Chan<i32>,
            c2: Chan<i32>,
            tick: MsgBuffer<()>,
            timer: AsyncTimer,
            win: AsyncResult<usize>,
            took: AsyncResult<()>,
            st: AsyncResult<()>,
            tx: mpsc::Sender<(usize, Duration)>,
            start: Instant,
        }

        let gen = Gen::create(
            &strand,
            Ctx {
                sel: Select::new(&strand),
                c1: c1.clone(),
                c2: c2.clone(),
                tick: tick.clone(),
                timer: AsyncTimer::new(&strand),
                win: AsyncResult::new(),
                took: AsyncResult::new(),
                st: AsyncResult::new(),
                tx,
                start: Instant::now(),
            },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        co_lock_stop!(co);
                        cx.sel.arm(0, &cx.c1);
                        cx.sel.arm(1, &cx.c2);
                        cx.sel.arm(2, &cx.tick);
                        let tick = cx.tick.clone();
                        cx.timer.timeout(50, move || tick.push(|_| {}, ()));
                        cx.sel.wait(co.result_notify(&cx.win));
                        co_await!(co => 1);
                    }
                    1 => {
                        let (state, id) = cx.win.take();
                        assert!(state.is_ok());
                        assert_eq!(id, Some(2));
                        cx.tick.try_pop(co.result_notify(&cx.took));
                        co_await!(co => 2);
                    }
                    2 => {
                        assert!(cx.took.state().is_ok());
                        cx.sel.retract(0, &cx.c1, co.state_notify(&cx.st));
                        co_await!(co => 3);
                    }
                    3 => {
                        assert!(cx.st.state().is_ok());
                        cx.sel.retract(1, &cx.c2, co.state_notify(&cx.st));
                        co_await!(co => 4);
                    }
                    4 => {
                        assert!(cx.st.state().is_ok());
                        cx.sel.close(co.done_notify());
                        co_await!(co => 5);
                    }
                    5 => {
                        co_unlock_stop!(co);
                        cx.tx.send((2, cx.start.elapsed())).unwrap();
                        return Step::Done;
                    }
                    _ => unreachable!(),
                }
            },
        );
        gen.run();

        let (winner, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(winner, 2);
        assert!(elapsed >= Duration::from_millis(50));

        // Retraction verified: a push wakes no stale registration
        c1.push(|_| {}, 1);
        c2.push(|_| {}, 2);
        std::thread::sleep(Duration::from_millis(50));
        pool.shutdown();
    }

    // A generator parked in pop() wakes with Closed when another
    // generator closes the channel.
    #[test]
    fn test_close_wakes_parked_pop() {
        let pool = IoPool::new(2).unwrap();
        let s1 = pool.strand();
        let s2 = pool.strand();
        let chan: Chan<i32> = Chan::new(&s1, 1);
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Popper {
            chan: Chan<i32>,
            got: AsyncResult<i32>,
            tx: mpsc::Sender<AsyncState>,
        }

        let popper = Gen::create(
            &s1,
            Popper {
                chan: chan.clone(),
                got: AsyncResult::new(),
                tx,
            },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        co_chan_pop!(co, cx.chan, cx.got => 1);
                    }
                    1 => {
                        let (state, value) = cx.got.take();
                        assert!(value.is_none());
                        cx.tx.send(state).unwrap();
                        return Step::Done;
                    }
                    _ => unreachable!(),
                }
            },
        );
        popper.run();

        std::thread::sleep(Duration::from_millis(50));

        #[derive(Clone)]
        struct Closer {
            chan: Chan<i32>,
        }

        let closer = Gen::create(&s2, Closer { chan }, |co, cx| loop {
            match co.pc() {
                0 => {
                    cx.chan.close_with(co.done_notify());
                    co_await!(co => 1);
                }
                1 => return Step::Done,
                _ => unreachable!(),
            }
        });
        closer.run();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            AsyncState::Closed
        );
        pool.shutdown();
    }

    // Two generators contend a CoMutex; the hand-off serializes their
    // critical sections.
    #[test]
    fn test_mutex_serializes_generators() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let mx = CoMutex::new(&strand);
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Ctx {
            mx: CoMutex,
            st: AsyncResult<()>,
            name: &'static str,
            tx: mpsc::Sender<&'static str>,
        }

        for name in ["first", "second"] {
            let gen = Gen::create(
                &strand,
                Ctx {
                    mx: mx.clone(),
                    st: AsyncResult::new(),
                    name,
                    tx: tx.clone(),
                },
                |co, cx| loop {
                    match co.pc() {
                        0 => {
                            cx.mx.lock(co.state_notify(&cx.st));
                            co_await!(co => 1);
                        }
                        1 => {
                            assert!(cx.st.state().is_ok());
                            cx.tx.send(cx.name).unwrap();
                            cx.mx.unlock(co.done_notify());
                            co_await!(co => 2);
                        }
                        2 => return Step::Done,
                        _ => unreachable!(),
                    }
                },
            );
            gen.run();
        }

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "first");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "second");
        pool.shutdown();
    }
}
