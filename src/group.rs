//! Ranks as threads of one process.
//!
//! [`ThreadGroup`] runs one closure per rank on scoped threads and hands each a [`Member`]
//! implementing [`Communicator`]. Collectives go through a single mutex-guarded rendezvous, so
//! the group behaves like a [`World`](crate::World) without spawning processes or touching
//! shared memory.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;

use log::{debug, error};

use crate::comm::{Communicator, Context};
use crate::{Result, RuntimeError};

/// Abort code posted when a rank's closure panics, matching the exit status of a panicking
/// Rust process.
pub const PANIC_CODE: i32 = 101;

#[derive(Default)]
struct Rendezvous {
    arrived: usize,
    acc: u64,
    generation: u64,
    result: u64,
    abort_code: Option<i32>,
}

struct Shared {
    size: usize,
    state: Mutex<Rendezvous>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Rendezvous> {
        // A panicking member never holds the lock across user code.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A fixed-size group of ranks backed by threads.
#[derive(Debug, Clone, Copy)]
pub struct ThreadGroup {
    size: usize,
}

impl ThreadGroup {
    /// # Panics
    ///
    /// If `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "a thread group needs at least one rank");
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` once per rank, concurrently, and return the results in rank order.
    ///
    /// A panic escaping `f` on any rank aborts the group with [`PANIC_CODE`], so peers blocked
    /// in a collective fail with [`RuntimeError::Aborted`] instead of waiting forever. The panic
    /// is resumed on the caller after all ranks have been joined.
    pub fn run<F, R>(&self, f: F) -> Vec<R>
    where
        F: Fn(&Member<'_>) -> R + Sync,
        R: Send,
    {
        let shared = Shared {
            size: self.size,
            state: Mutex::new(Rendezvous::default()),
            cond: Condvar::new(),
        };

        thread::scope(|scope| {
            let handles: Vec<_> = (0..self.size)
                .map(|rank| {
                    let member = Member {
                        ctx: Context::new(rank, self.size),
                        shared: &shared,
                    };
                    let f = &f;
                    scope.spawn(move || {
                        match panic::catch_unwind(AssertUnwindSafe(|| f(&member))) {
                            Ok(result) => result,
                            Err(payload) => {
                                member.abort(PANIC_CODE);
                                panic::resume_unwind(payload)
                            }
                        }
                    })
                })
                .collect();

            let joined: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
            joined
                .into_iter()
                .map(|r| r.unwrap_or_else(|payload| panic::resume_unwind(payload)))
                .collect()
        })
    }
}

/// One rank of a [`ThreadGroup`].
pub struct Member<'a> {
    ctx: Context,
    shared: &'a Shared,
}

impl Member<'_> {
    fn rendezvous(&self, contribution: u64) -> Result<u64> {
        let shared = self.shared;
        let mut state = shared.lock();
        if let Some(code) = state.abort_code {
            return Err(RuntimeError::Aborted(code));
        }

        state.acc = state.acc.wrapping_add(contribution);
        state.arrived += 1;

        if state.arrived == shared.size {
            state.result = state.acc;
            state.acc = 0;
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            shared.cond.notify_all();
            return Ok(state.result);
        }

        let generation = state.generation;
        let state = shared
            .cond
            .wait_while(state, |s| s.generation == generation && s.abort_code.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.generation != generation {
            Ok(state.result)
        } else {
            Err(RuntimeError::Aborted(state.abort_code.unwrap_or(1)))
        }
    }
}

impl Communicator for Member<'_> {
    fn context(&self) -> Context {
        self.ctx
    }

    fn barrier(&self) -> Result<()> {
        debug!("Rank {} entering barrier", self.ctx.rank());
        self.rendezvous(0).map(|_| ())
    }

    fn all_reduce_sum(&self, local: u64) -> Result<u64> {
        debug!("Rank {} contributing {} to all-reduce", self.ctx.rank(), local);
        self.rendezvous(local)
    }

    fn abort(&self, code: i32) -> RuntimeError {
        let mut state = self.shared.lock();
        let code = *state.abort_code.get_or_insert(code);
        error!("Rank {} aborting group with code {}", self.ctx.rank(), code);
        self.shared.cond.notify_all();
        RuntimeError::Aborted(code)
    }
}
