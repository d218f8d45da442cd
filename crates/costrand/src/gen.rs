//! Stackless generators
//!
//! A generator is a resumable computation pinned to a strand. It owns
//! no machine stack: its locals live in a user-supplied context frame
//! (`C: Clone`), and its resume point is an integer the body dispatches
//! on. Millions can coexist, each costing only its frame.
//!
//! The body is a plain `Fn(&mut Co, &mut C) -> Step` shared between
//! siblings through an `Arc`; `fork` clones the frame, never the body.
//! A body is written as a loop over `co.pc()`:
//!
//! ```ignore
//! let gen = Gen::create(&strand, Ctx { st: AsyncResult::new(), chan, n: 0 }, |co, cx| {
//!     loop {
//!         match co.pc() {
//!             0 => {
//!                 cx.chan.push(co.state_notify(&cx.st), cx.n);
//!                 co_await!(co => 1);
//!             }
//!             1 => {
//!                 if !cx.st.state().is_ok() {
//!                     return Step::Done;
//!                 }
//!                 cx.n += 1;
//!                 co.jump(0);
//!             }
//!             _ => unreachable!(),
//!         }
//!     }
//! });
//! gen.run();
//! ```
//!
//! Suspension is explicit: `co_await!` (paired with a notify built by
//! `Co`), `co_yield!`, `co_tick!`, `co_sleep!`. Between suspension
//! points the strand's exclusivity covers every frame access, so the
//! body needs no locking of its own.
//!
//! Cancellation is cooperative: `stop()` short-circuits the next resume
//! to the cleanup path unless the body holds a stop lock, in which case
//! the request is deferred to `co_unlock_stop!`. Callbacks that may
//! outlive the generator consult its `SharedSign` and give up silently.

use costrand_core::sign::SharedSign;
use costrand_core::spinlock::SpinLock;
use costrand_core::state::AsyncState;
use costrand_runtime::strand::Strand;
use costrand_runtime::timer::AsyncTimer;

use std::sync::Arc;

/// What a generator body returns from one resumption
#[derive(Debug)]
pub enum Step {
    /// The body suspended; a stored resume point will continue it
    Pending,

    /// The body finished (normally or via a stop)
    Done,

    /// Fork a sibling whose frame is a clone of the current one; both
    /// parent and child continue at the given resume point
    Fork(u32),
}

/// Outcome of an await site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspend {
    /// The completion already fired; continue without yielding
    Ready,

    /// Parked; return `Step::Pending`
    Park,

    /// Stop was requested; return `Step::Done`
    Stop,
}

/// Shared result cell filled by a notify and read by the body after an
/// await. One per await site, typically stored in the context frame.
pub struct AsyncResult<T> {
    inner: Arc<SpinLock<(AsyncState, Option<T>)>>,
}

impl<T> AsyncResult<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SpinLock::new((AsyncState::Undefined, None))),
        }
    }

    /// Store a completion
    pub fn set(&self, state: AsyncState, value: Option<T>) {
        *self.inner.lock() = (state, value);
    }

    /// Completion state of the last operation
    pub fn state(&self) -> AsyncState {
        self.inner.lock().0
    }

    /// Take state and value, resetting the cell
    pub fn take(&self) -> (AsyncState, Option<T>) {
        std::mem::replace(&mut *self.inner.lock(), (AsyncState::Undefined, None))
    }

    /// Take just the value
    pub fn take_value(&self) -> Option<T> {
        self.inner.lock().1.take()
    }
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for AsyncResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased context frame plus its body
trait CtxFrame: Send {
    fn resume(&mut self, co: &mut Co) -> Step;
    fn fork_box(&self) -> Box<dyn CtxFrame>;
}

struct CtxCell<C> {
    ctx: C,
    handler: Arc<dyn Fn(&mut Co, &mut C) -> Step + Send + Sync>,
}

impl<C: Clone + Send + 'static> CtxFrame for CtxCell<C> {
    fn resume(&mut self, co: &mut Co) -> Step {
        (self.handler)(co, &mut self.ctx)
    }

    fn fork_box(&self) -> Box<dyn CtxFrame> {
        Box::new(CtxCell {
            ctx: self.ctx.clone(),
            handler: Arc::clone(&self.handler),
        })
    }
}

/// Engine-owned part of the frame
struct Frame {
    /// Pending resume point; 0 = entry, -1 = stop requested
    co_next: i32,

    /// Stop-deferral depth
    lock_stop: u8,

    /// A stop arrived while the stop lock was held
    ready_quit: bool,

    /// Two-state rendezvous between an await site and its completion
    async_sign: bool,

    /// Disarm flag handed to shareable callbacks; set true on every
    /// resume and at termination
    shared_sign: Option<SharedSign>,

    /// `run()` was called
    started: bool,

    /// Cleared at termination; late callbacks check this first
    alive: bool,

    /// Handle to the most recent fork, taken by the parent
    last_fork: Option<Gen>,
}

enum BodySlot {
    Idle(Box<dyn CtxFrame>),
    Running,
    Dead,
}

struct GenInner {
    strand: Strand,
    timer: AsyncTimer,
    frame: SpinLock<Frame>,
    body: SpinLock<BodySlot>,
    notify: SpinLock<Option<Box<dyn FnOnce() + Send>>>,
}

/// Handle to a generator. Clones share the generator.
#[derive(Clone)]
pub struct Gen {
    inner: Arc<GenInner>,
}

impl Gen {
    /// Create a generator on `strand` with context frame `ctx` and body `f`
    pub fn create<C, F>(strand: &Strand, ctx: C, f: F) -> Gen
    where
        C: Clone + Send + 'static,
        F: Fn(&mut Co, &mut C) -> Step + Send + Sync + 'static,
    {
        Self::build(
            strand,
            Box::new(CtxCell {
                ctx,
                handler: Arc::new(f),
            }),
            None,
            0,
            0,
        )
    }

    /// Like [`create`](Self::create), with a completion notify invoked
    /// once when the generator terminates
    pub fn create_with_notify<C, F, N>(strand: &Strand, ctx: C, f: F, notify: N) -> Gen
    where
        C: Clone + Send + 'static,
        F: Fn(&mut Co, &mut C) -> Step + Send + Sync + 'static,
        N: FnOnce() + Send + 'static,
    {
        Self::build(
            strand,
            Box::new(CtxCell {
                ctx,
                handler: Arc::new(f),
            }),
            Some(Box::new(notify)),
            0,
            0,
        )
    }

    fn build(
        strand: &Strand,
        cell: Box<dyn CtxFrame>,
        notify: Option<Box<dyn FnOnce() + Send>>,
        co_next: i32,
        lock_stop: u8,
    ) -> Gen {
        Gen {
            inner: Arc::new(GenInner {
                strand: strand.clone(),
                timer: AsyncTimer::new(strand),
                frame: SpinLock::new(Frame {
                    co_next,
                    lock_stop,
                    ready_quit: false,
                    async_sign: false,
                    shared_sign: None,
                    started: false,
                    alive: true,
                    last_fork: None,
                }),
                body: SpinLock::new(BodySlot::Idle(cell)),
                notify: SpinLock::new(notify),
            }),
        }
    }

    /// The strand this generator is pinned to
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// First entry: execute the body until its first suspension
    pub fn run(&self) {
        let gen = self.clone();
        self.inner.strand.distribute(move || {
            {
                let mut fr = gen.inner.frame.lock();
                if !fr.alive {
                    return;
                }
                assert!(!fr.started, "generator run twice");
                fr.started = true;
            }
            gen.do_resume();
        });
    }

    /// Request cooperative cancellation
    ///
    /// If the body holds a stop lock the request is deferred to the
    /// matching unlock; otherwise the next resume short-circuits to
    /// cleanup (immediately, if the generator is parked).
    pub fn stop(&self) {
        let gen = self.clone();
        self.inner.strand.distribute(move || {
            let resume = {
                let mut fr = gen.inner.frame.lock();
                if !fr.alive {
                    return;
                }
                if fr.lock_stop > 0 {
                    fr.ready_quit = true;
                    return;
                }
                fr.co_next = -1;
                // Mid-execution the body observes the stop at its next
                // suspension point; only a parked generator is resumed.
                !matches!(*gen.inner.body.lock(), BodySlot::Running)
            };
            if resume {
                gen.do_resume();
            }
        });
    }

    /// True until the generator terminates
    pub fn is_alive(&self) -> bool {
        self.inner.frame.lock().alive
    }

    /// Re-enter a parked generator at its stored resume point
    pub fn resume(&self) {
        let gen = self.clone();
        self.inner.strand.distribute(move || gen.do_resume());
    }

    /// Like [`resume`](Self::resume), scheduled through the strand's
    /// coalescing tick path
    pub fn tick_resume(&self) {
        let gen = self.clone();
        self.inner.strand.try_tick(move || gen.do_resume());
    }

    /// Completion-handler resume: the two-state rendezvous with the
    /// body's await site. Fire-then-wait and wait-then-fire both work
    /// without extra allocation.
    pub fn async_resume(&self) {
        let gen = self.clone();
        self.inner.strand.distribute(move || {
            let fire = {
                let mut fr = gen.inner.frame.lock();
                if !fr.alive {
                    return;
                }
                if fr.async_sign {
                    fr.async_sign = false;
                    true
                } else {
                    fr.async_sign = true;
                    false
                }
            };
            if fire {
                gen.do_resume();
            }
        });
    }

    fn make_sibling(&self, cell: Box<dyn CtxFrame>, at: u32) -> Gen {
        let lock_stop = self.inner.frame.lock().lock_stop;
        Self::build(&self.inner.strand, cell, None, at as i32, lock_stop)
    }

    /// Resume the body on the strand. All suspension bookkeeping runs
    /// through here.
    fn do_resume(&self) {
        debug_assert!(self.inner.strand.running_in_this_thread());

        let mut pc = {
            let mut fr = self.inner.frame.lock();
            if !fr.alive {
                return;
            }
            // Any shared callback armed before this resume is stale now.
            if let Some(sign) = fr.shared_sign.take() {
                sign.set(true);
            }
            if fr.co_next < 0 {
                drop(fr);
                self.finish();
                return;
            }
            let pc = fr.co_next as u32;
            fr.co_next = 0;
            pc
        };

        let mut body = {
            let mut slot = self.inner.body.lock();
            match std::mem::replace(&mut *slot, BodySlot::Running) {
                BodySlot::Idle(b) => b,
                BodySlot::Running => panic!("generator resumed while running"),
                BodySlot::Dead => {
                    *slot = BodySlot::Dead;
                    return;
                }
            }
        };

        loop {
            let mut co = Co {
                gen: self.clone(),
                pc,
            };
            let step = body.resume(&mut co);
            match step {
                Step::Pending => {
                    *self.inner.body.lock() = BodySlot::Idle(body);
                    // A stop may have landed while the body ran.
                    let stop_now = {
                        let fr = self.inner.frame.lock();
                        fr.alive && fr.co_next < 0
                    };
                    if stop_now {
                        self.finish();
                    }
                    return;
                }
                Step::Done => {
                    drop(body);
                    self.finish();
                    return;
                }
                Step::Fork(at) => {
                    let child = self.make_sibling(body.fork_box(), at);
                    self.inner.frame.lock().last_fork = Some(child.clone());
                    // Child runs inline to its first suspension, then the
                    // parent continues from the same point.
                    child.run();
                    pc = at;
                }
            }
        }
    }

    /// Terminate: drop the frame, disarm late callbacks, fire the
    /// completion notify.
    fn finish(&self) {
        {
            let mut fr = self.inner.frame.lock();
            if !fr.alive {
                return;
            }
            fr.alive = false;
            if let Some(sign) = fr.shared_sign.take() {
                sign.set(true);
            }
            fr.last_fork = None;
        }
        self.inner.timer.cancel();
        let old = std::mem::replace(&mut *self.inner.body.lock(), BodySlot::Dead);
        drop(old);
        if let Some(ntf) = self.inner.notify.lock().take() {
            ntf();
        }
    }
}

impl std::fmt::Debug for Gen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gen")
            .field("strand", &self.inner.strand.id())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Body-side view of the running generator
pub struct Co {
    gen: Gen,
    pc: u32,
}

impl Co {
    /// Resume point this entry dispatched to
    #[inline]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Fall through to another arm without suspending
    #[inline]
    pub fn jump(&mut self, n: u32) {
        self.pc = n;
    }

    /// Handle to the generator itself
    pub fn gen(&self) -> &Gen {
        &self.gen
    }

    /// The strand the body runs on
    pub fn strand(&self) -> &Strand {
        self.gen.strand()
    }

    /// Store resume point `n` and give up the strand. The generator
    /// continues only when something calls `resume()`.
    pub fn yield_at(&mut self, n: u32) -> Step {
        let mut fr = self.gen.inner.frame.lock();
        if fr.co_next < 0 {
            return Step::Done;
        }
        fr.co_next = n as i32;
        Step::Pending
    }

    /// Yield and re-schedule automatically behind the work already
    /// queued on the strand
    pub fn tick_at(&mut self, n: u32) -> Step {
        {
            let mut fr = self.gen.inner.frame.lock();
            if fr.co_next < 0 {
                return Step::Done;
            }
            fr.co_next = n as i32;
        }
        let gen = self.gen.clone();
        self.gen.strand().next_tick(move || gen.do_resume());
        Step::Pending
    }

    /// Suspend for `ms` milliseconds, resuming at `n`
    pub fn sleep_at(&mut self, ms: u64, n: u32) -> Step {
        {
            let mut fr = self.gen.inner.frame.lock();
            if fr.co_next < 0 {
                return Step::Done;
            }
            fr.co_next = n as i32;
        }
        let gen = self.gen.clone();
        self.gen.inner.timer.timeout(ms, move || gen.do_resume());
        Step::Pending
    }

    /// Await site, paired with one outstanding notify built by this
    /// `Co`. If the completion already fired, consumes it and reports
    /// `Ready`; otherwise arms the rendezvous and reports `Park`.
    pub fn await_at(&mut self, n: u32) -> Suspend {
        let mut fr = self.gen.inner.frame.lock();
        if fr.co_next < 0 {
            return Suspend::Stop;
        }
        if fr.async_sign {
            fr.async_sign = false;
            drop(fr);
            self.pc = n;
            Suspend::Ready
        } else {
            fr.async_sign = true;
            fr.co_next = n as i32;
            Suspend::Park
        }
    }

    /// Defer external `stop()` requests until the matching unlock
    pub fn lock_stop(&self) {
        let mut fr = self.gen.inner.frame.lock();
        debug_assert!(fr.lock_stop < u8::MAX);
        fr.lock_stop += 1;
    }

    /// Release one stop deferral. Returns true if a deferred stop must
    /// now take effect (the body returns `Step::Done`).
    pub fn unlock_stop(&self) -> bool {
        let mut fr = self.gen.inner.frame.lock();
        assert!(fr.lock_stop > 0, "stop-lock underflow");
        fr.lock_stop -= 1;
        fr.lock_stop == 0 && fr.ready_quit
    }

    /// Reset the engine frame and re-enter the body at the top. The
    /// caller re-initializes its own locals in arm 0.
    pub fn restart(&mut self) {
        let mut fr = self.gen.inner.frame.lock();
        fr.co_next = 0;
        fr.lock_stop = 0;
        fr.ready_quit = false;
        fr.async_sign = false;
        if let Some(sign) = fr.shared_sign.take() {
            sign.set(true);
        }
        drop(fr);
        self.pc = 0;
    }

    /// Handle to the sibling created by the last `Step::Fork`; `Some`
    /// in the parent, `None` in the child
    pub fn take_fork(&self) -> Option<Gen> {
        self.gen.inner.frame.lock().last_fork.take()
    }

    /// Run a nested generator on the same strand, then await its
    /// completion at `n`
    pub fn call_at<C, F>(&mut self, ctx: C, f: F, n: u32) -> Suspend
    where
        C: Clone + Send + 'static,
        F: Fn(&mut Co, &mut C) -> Step + Send + Sync + 'static,
    {
        if self.gen.inner.frame.lock().co_next < 0 {
            return Suspend::Stop;
        }
        let child = Gen::create_with_notify(self.strand(), ctx, f, self.done_notify());
        child.run();
        self.await_at(n)
    }

    /// Bare completion notify: resumes the body through the await
    /// rendezvous (used with `close_with`, nested calls, ...)
    pub fn done_notify(&self) -> impl FnOnce() + Send + 'static {
        let gen = self.gen.clone();
        move || gen.async_resume()
    }

    /// State-only notify for push/lock-style operations
    pub fn state_notify(&self, res: &AsyncResult<()>) -> impl FnOnce(AsyncState) + Send + 'static {
        let gen = self.gen.clone();
        let res = res.clone();
        move |state| {
            res.set(state, Some(()));
            gen.async_resume();
        }
    }

    /// State-and-value notify for pop-style operations
    pub fn result_notify<T: Send + 'static>(
        &self,
        res: &AsyncResult<T>,
    ) -> impl FnOnce(AsyncState, Option<T>) + Send + 'static {
        let gen = self.gen.clone();
        let res = res.clone();
        move |state, value| {
            res.set(state, value);
            gen.async_resume();
        }
    }

    /// Value-only notify for completions that always succeed with a
    /// payload (socket results and the like)
    pub fn value_notify<T: Send + 'static>(
        &self,
        res: &AsyncResult<T>,
    ) -> impl FnOnce(T) + Send + 'static {
        let gen = self.gen.clone();
        let res = res.clone();
        move |value| {
            res.set(AsyncState::Ok, Some(value));
            gen.async_resume();
        }
    }

    /// The disarm flag for shareable callbacks, created on first use
    /// and invalidated on the next resume
    pub fn shared_sign(&self) -> SharedSign {
        let mut fr = self.gen.inner.frame.lock();
        match &fr.shared_sign {
            Some(sign) => sign.clone(),
            None => {
                let sign = SharedSign::new();
                fr.shared_sign = Some(sign.clone());
                sign
            }
        }
    }

    /// Like [`state_notify`](Self::state_notify), but the callback may
    /// be retained by an external subsystem: once the generator resumes
    /// or terminates, late fires become no-ops.
    pub fn shared_state_notify(
        &self,
        res: &AsyncResult<()>,
    ) -> impl FnOnce(AsyncState) + Send + 'static {
        let gen = self.gen.clone();
        let sign = self.shared_sign();
        let res = res.clone();
        move |state| {
            let inner_gen = gen.clone();
            gen.strand().distribute(move || {
                if sign.is_true() {
                    return;
                }
                res.set(state, Some(()));
                inner_gen.async_resume();
            });
        }
    }

    /// Shareable state-and-value notify
    pub fn shared_result_notify<T: Send + 'static>(
        &self,
        res: &AsyncResult<T>,
    ) -> impl FnOnce(AsyncState, Option<T>) + Send + 'static {
        let gen = self.gen.clone();
        let sign = self.shared_sign();
        let res = res.clone();
        move |state, value| {
            let inner_gen = gen.clone();
            gen.strand().distribute(move || {
                if sign.is_true() {
                    return;
                }
                res.set(state, value);
                inner_gen.async_resume();
            });
        }
    }
}

/// Await an outstanding notify; suspends unless the completion already
/// fired. Use inside a `loop { match co.pc() { ... } }` body.
#[macro_export]
macro_rules! co_await {
    ($co:expr => $n:expr) => {
        match $co.await_at($n) {
            $crate::gen::Suspend::Ready => continue,
            $crate::gen::Suspend::Park => return $crate::gen::Step::Pending,
            $crate::gen::Suspend::Stop => return $crate::gen::Step::Done,
        }
    };
}

/// Yield the strand; something must call `resume()` to continue at `$n`
#[macro_export]
macro_rules! co_yield {
    ($co:expr => $n:expr) => {
        return $co.yield_at($n)
    };
}

/// Yield and automatically continue at `$n` behind the queued work
#[macro_export]
macro_rules! co_tick {
    ($co:expr => $n:expr) => {
        return $co.tick_at($n)
    };
}

/// Suspend for `$ms` milliseconds, continuing at `$n`
#[macro_export]
macro_rules! co_sleep {
    ($co:expr, $ms:expr => $n:expr) => {
        return $co.sleep_at($ms, $n)
    };
}

/// Enter a stop-deferral bracket
#[macro_export]
macro_rules! co_lock_stop {
    ($co:expr) => {
        $co.lock_stop()
    };
}

/// Leave a stop-deferral bracket, terminating if a stop was deferred
#[macro_export]
macro_rules! co_unlock_stop {
    ($co:expr) => {
        if $co.unlock_stop() {
            return $crate::gen::Step::Done;
        }
    };
}

/// Push onto a channel and await the completion state in `$cell`
#[macro_export]
macro_rules! co_chan_push {
    ($co:expr, $chan:expr, $cell:expr, $v:expr => $n:expr) => {
        $chan.push($co.state_notify(&$cell), $v);
        $crate::co_await!($co => $n)
    };
}

/// Pop from a channel and await state + value in `$cell`
#[macro_export]
macro_rules! co_chan_pop {
    ($co:expr, $chan:expr, $cell:expr => $n:expr) => {
        $chan.pop($co.result_notify(&$cell));
        $crate::co_await!($co => $n)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use costrand_runtime::pool::IoPool;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[derive(Clone)]
    struct TxCtx {
        tx: mpsc::Sender<&'static str>,
    }

    #[test]
    fn test_run_to_completion_fires_notify() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let (tx, rx) = mpsc::channel();
        let (ntx, nrx) = mpsc::channel();

        let gen = Gen::create_with_notify(
            &strand,
            TxCtx { tx },
            |_co, cx| {
                cx.tx.send("ran").unwrap();
                Step::Done
            },
            move || {
                ntx.send("done").unwrap();
            },
        );
        gen.run();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ran");
        assert_eq!(nrx.recv_timeout(Duration::from_secs(5)).unwrap(), "done");
        assert!(!gen.is_alive());
        pool.shutdown();
    }

    #[test]
    fn test_yield_then_resume() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let (tx, rx) = mpsc::channel();

        let gen = Gen::create(&strand, TxCtx { tx }, |co, cx| loop {
            match co.pc() {
                0 => {
                    cx.tx.send("first").unwrap();
                    co_yield!(co => 1);
                }
                1 => {
                    cx.tx.send("second").unwrap();
                    return Step::Done;
                }
                _ => unreachable!(),
            }
        });
        gen.run();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "first");
        // Parked until explicitly resumed
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        gen.resume();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "second");
        pool.shutdown();
    }

    #[test]
    fn test_tick_reschedules_itself() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let (tx, rx) = mpsc::channel();

        let gen = Gen::create(&strand, TxCtx { tx }, |co, cx| loop {
            match co.pc() {
                0 => {
                    cx.tx.send("tick").unwrap();
                    co_tick!(co => 1);
                }
                1 => {
                    cx.tx.send("tock").unwrap();
                    return Step::Done;
                }
                _ => unreachable!(),
            }
        });
        gen.run();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "tick");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "tock");
        pool.shutdown();
    }

    #[test]
    fn test_sleep_resumes_after_deadline() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Ctx {
            tx: mpsc::Sender<Duration>,
            start: Instant,
        }

        let gen = Gen::create(
            &strand,
            Ctx {
                tx,
                start: Instant::now(),
            },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        co_sleep!(co, 30 => 1);
                    }
                    1 => {
                        cx.tx.send(cx.start.elapsed()).unwrap();
                        return Step::Done;
                    }
                    _ => unreachable!(),
                }
            },
        );
        gen.run();

        let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed >= Duration::from_millis(30));
        pool.shutdown();
    }

    #[test]
    fn test_await_with_late_completion() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let other = pool.strand();
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Ctx {
            tx: mpsc::Sender<i32>,
            cell: AsyncResult<i32>,
            other: Strand,
        }

        let gen = Gen::create(
            &strand,
            Ctx {
                tx,
                cell: AsyncResult::new(),
                other,
            },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        // Completion fires from another strand after a delay.
                        let notify = co.value_notify(&cx.cell);
                        cx.other.post(move || {
                            std::thread::sleep(Duration::from_millis(20));
                            notify(41);
                        });
                        co_await!(co => 1);
                    }
                    1 => {
                        let v = cx.cell.take_value().unwrap();
                        cx.tx.send(v + 1).unwrap();
                        return Step::Done;
                    }
                    _ => unreachable!(),
                }
            },
        );
        gen.run();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        pool.shutdown();
    }

    #[test]
    fn test_await_with_inline_completion() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Ctx {
            tx: mpsc::Sender<i32>,
            cell: AsyncResult<i32>,
        }

        let gen = Gen::create(
            &strand,
            Ctx {
                tx,
                cell: AsyncResult::new(),
            },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        // Fire the completion before the await: the body
                        // must continue without parking.
                        let notify = co.value_notify(&cx.cell);
                        notify(10);
                        co_await!(co => 1);
                    }
                    1 => {
                        cx.tx.send(cx.cell.take_value().unwrap()).unwrap();
                        return Step::Done;
                    }
                    _ => unreachable!(),
                }
            },
        );
        gen.run();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 10);
        pool.shutdown();
    }

    #[test]
    fn test_stop_while_parked() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let (ntx, nrx) = mpsc::channel();
        let (tx, _rx) = mpsc::channel();

        let gen = Gen::create_with_notify(
            &strand,
            TxCtx { tx },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        co_yield!(co => 1);
                    }
                    1 => {
                        // Never reached: stop lands first
                        cx.tx.send("unreachable").unwrap();
                        return Step::Done;
                    }
                    _ => unreachable!(),
                }
            },
            move || {
                ntx.send(()).unwrap();
            },
        );
        gen.run();
        std::thread::sleep(Duration::from_millis(50));
        gen.stop();

        nrx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!gen.is_alive());
        pool.shutdown();
    }

    #[test]
    fn test_stop_deferred_by_lock_stop() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let (tx, rx) = mpsc::channel();
        let (ntx, nrx) = mpsc::channel();

        #[derive(Clone)]
        struct Ctx {
            tx: mpsc::Sender<&'static str>,
            start: Instant,
        }

        let gen = Gen::create_with_notify(
            &strand,
            Ctx {
                tx,
                start: Instant::now(),
            },
            |co, cx| loop {
                match co.pc() {
                    0 => {
                        co_lock_stop!(co);
                        co_sleep!(co, 100 => 1);
                    }
                    1 => {
                        // The sleep ran to its full deadline despite the stop
                        cx.tx.send("slept").unwrap();
                        assert!(cx.start.elapsed() >= Duration::from_millis(100));
                        co_unlock_stop!(co);
                        cx.tx.send("past unlock").unwrap();
                        return Step::Done;
                    }
                    _ => unreachable!(),
                }
            },
            move || {
                ntx.send(()).unwrap();
            },
        );
        gen.run();

        std::thread::sleep(Duration::from_millis(10));
        gen.stop();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "slept");
        nrx.recv_timeout(Duration::from_secs(5)).unwrap();
        // Terminated exactly at the unlock: nothing past it ran
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!gen.is_alive());
        pool.shutdown();
    }

    #[test]
    fn test_fork_child_inherits_frame() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Ctx {
            tx: mpsc::Sender<(bool, i32)>,
            value: i32,
        }

        let gen = Gen::create(&strand, Ctx { tx, value: 7 }, |co, cx| loop {
            match co.pc() {
                0 => {
                    cx.value = 13;
                    return Step::Fork(1);
                }
                1 => {
                    // Parent holds the fork handle, the child does not;
                    // both see the pre-fork locals.
                    let is_parent = co.take_fork().is_some();
                    cx.tx.send((is_parent, cx.value)).unwrap();
                    return Step::Done;
                }
                _ => unreachable!(),
            }
        });
        gen.run();

        let a = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let b = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let mut flags = [a.0, b.0];
        flags.sort();
        assert_eq!(flags, [false, true]);
        assert_eq!(a.1, 13);
        assert_eq!(b.1, 13);
        pool.shutdown();
    }

    #[test]
    fn test_fork_inherits_stop_lock() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Ctx {
            tx: mpsc::Sender<&'static str>,
        }

        let gen = Gen::create(&strand, Ctx { tx }, |co, cx| loop {
            match co.pc() {
                0 => {
                    co_lock_stop!(co);
                    return Step::Fork(1);
                }
                1 => {
                    if co.take_fork().is_some() {
                        // Parent: done, stop lock released with the frame
                        return Step::Done;
                    }
                    // Child: the inherited stop lock defers this stop
                    co.gen().stop();
                    co_sleep!(co, 30 => 2);
                }
                2 => {
                    cx.tx.send("child slept").unwrap();
                    co_unlock_stop!(co);
                    cx.tx.send("unreachable").unwrap();
                    return Step::Done;
                }
                _ => unreachable!(),
            }
        });
        gen.run();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "child slept"
        );
        // The deferred stop fired at the unlock
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        pool.shutdown();
    }

    #[test]
    fn test_call_nested_generator() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Ctx {
            tx: mpsc::Sender<&'static str>,
        }

        let gen = Gen::create(&strand, Ctx { tx }, |co, cx| loop {
            match co.pc() {
                0 => {
                    let tx = cx.tx.clone();
                    match co.call_at(
                        tx,
                        |_co: &mut Co, tx: &mut mpsc::Sender<&'static str>| {
                            tx.send("child").unwrap();
                            Step::Done
                        },
                        1,
                    ) {
                        Suspend::Ready => continue,
                        Suspend::Park => return Step::Pending,
                        Suspend::Stop => return Step::Done,
                    }
                }
                1 => {
                    cx.tx.send("parent").unwrap();
                    return Step::Done;
                }
                _ => unreachable!(),
            }
        });
        gen.run();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "child");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "parent");
        pool.shutdown();
    }

    #[test]
    fn test_restart_reenters_at_top() {
        let pool = IoPool::new(2).unwrap();
        let strand = pool.strand();
        let (tx, rx) = mpsc::channel();

        #[derive(Clone)]
        struct Ctx {
            tx: mpsc::Sender<u32>,
            rounds: u32,
        }

        let gen = Gen::create(&strand, Ctx { tx, rounds: 0 }, |co, cx| loop {
            match co.pc() {
                0 => {
                    cx.tx.send(cx.rounds).unwrap();
                    cx.rounds += 1;
                    if cx.rounds < 3 {
                        co.restart();
                        continue;
                    }
                    return Step::Done;
                }
                _ => unreachable!(),
            }
        });
        gen.run();

        for i in 0..3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), i);
        }
        pool.shutdown();
    }
}
