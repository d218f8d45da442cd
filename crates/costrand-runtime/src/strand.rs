//! Strands: serialized execution contexts over the pool
//!
//! A strand is a FIFO of callbacks with the guarantee that at most one
//! worker thread executes its callbacks at any instant. Many strands
//! multiplex onto one pool; a strand drains a bounded batch per pool
//! wake so a busy strand cannot monopolize a worker.
//!
//! Submission order from a single thread is execution order. Nothing is
//! ordered across strands.

use crate::pool::{IoPool, Job};

use costrand_core::clog;
use costrand_core::spinlock::SpinLock;

use std::collections::VecDeque;
use std::sync::Arc;

thread_local! {
    /// Strand currently draining on this thread, if any
    static CURRENT_STRAND: std::cell::Cell<Option<u64>> = const { std::cell::Cell::new(None) };
}

/// Handle to a strand. Clones share the strand.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

struct StrandInner {
    pool: IoPool,
    id: u64,
    state: SpinLock<StrandState>,
}

struct StrandState {
    /// Pending callbacks, FIFO
    queue: VecDeque<Job>,

    /// A worker is currently draining this strand
    running: bool,

    /// A drain job is sitting in the pool queue but has not started
    scheduled: bool,
}

impl Strand {
    pub(crate) fn new(pool: IoPool, id: u64) -> Self {
        Self {
            inner: Arc::new(StrandInner {
                pool,
                id,
                state: SpinLock::new(StrandState {
                    queue: VecDeque::new(),
                    running: false,
                    scheduled: false,
                }),
            }),
        }
    }

    /// Unique id of this strand
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The pool this strand is bound to
    #[inline]
    pub fn pool(&self) -> &IoPool {
        &self.inner.pool
    }

    /// True iff the calling thread is currently executing a callback of
    /// this strand
    #[inline]
    pub fn running_in_this_thread(&self) -> bool {
        CURRENT_STRAND.with(|c| c.get()) == Some(self.inner.id)
    }

    /// Enqueue `f`; it runs on some worker with this strand's
    /// exclusivity guarantee, after everything already queued.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(f));
    }

    /// Run `f` inline if the caller is already inside this strand,
    /// otherwise behave like [`post`](Self::post).
    pub fn distribute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.running_in_this_thread() {
            f();
        } else {
            self.enqueue(Box::new(f));
        }
    }

    /// Coalescing enqueue for async completion paths: at most one pool
    /// wake-up is outstanding per strand, so completion storms do not
    /// cause redundant scheduling. (Plain `post` shares the coalescing
    /// here; the name keeps the intent visible at the call site.)
    pub fn try_tick<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(f));
    }

    /// Enqueue `f` behind the work already queued, yielding the strand.
    ///
    /// Must be called from inside the strand; the pending drain picks
    /// the callback up without another pool wake. Called from outside,
    /// it degenerates to `post`.
    pub fn next_tick<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.running_in_this_thread() {
            self.enqueue(Box::new(f));
            return;
        }
        let mut st = self.inner.state.lock();
        debug_assert!(st.running);
        st.queue.push_back(Box::new(f));
    }

    /// Wrap `f` into a callback that, when invoked, distributes `f`
    /// onto this strand.
    pub fn wrap<F>(&self, f: F) -> impl FnOnce() + Send + 'static
    where
        F: FnOnce() + Send + 'static,
    {
        let strand = self.clone();
        move || strand.distribute(f)
    }

    fn enqueue(&self, job: Job) {
        let wake = {
            let mut st = self.inner.state.lock();
            st.queue.push_back(job);
            if st.running || st.scheduled {
                false
            } else {
                st.scheduled = true;
                true
            }
        };
        if wake {
            let inner = Arc::clone(&self.inner);
            self.inner.pool.post(move || drain(inner));
        }
    }
}

impl PartialEq for Strand {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Strand {}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand").field("id", &self.inner.id).finish()
    }
}

/// Drain a batch of callbacks. Runs on a pool worker.
fn drain(inner: Arc<StrandInner>) {
    {
        let mut st = inner.state.lock();
        st.scheduled = false;
        if st.running {
            // Another worker got here first; it will see our jobs.
            return;
        }
        st.running = true;
    }

    CURRENT_STRAND.with(|c| c.set(Some(inner.id)));
    let _log_ctx = clog::strand_scope(inner.id);

    let batch_limit = inner.pool.batch_limit();
    let mut executed = 0usize;

    loop {
        let job = {
            let mut st = inner.state.lock();
            match st.queue.pop_front() {
                Some(job) => job,
                None => {
                    st.running = false;
                    break;
                }
            }
        };

        job();
        executed += 1;

        if executed >= batch_limit {
            // Yield the worker to other strands; re-post if work remains.
            let reschedule = {
                let mut st = inner.state.lock();
                st.running = false;
                if !st.queue.is_empty() && !st.scheduled {
                    st.scheduled = true;
                    true
                } else {
                    false
                }
            };
            if reschedule {
                let again = Arc::clone(&inner);
                inner.pool.post(move || drain(again));
            }
            break;
        }
    }

    CURRENT_STRAND.with(|c| c.set(None));
}
