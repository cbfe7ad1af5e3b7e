//! Quiescence: the engine's only blocking synchronization.
//!
//! Two cooperating mechanisms let the engine stop the world without any
//! lock being taken on the transactional fast path:
//!
//! - Every thread registers a shared `ThreadState` holding its transaction
//!   status. The registry is only mutated under the quiesce mutex.
//! - A tri-state flag: 0 = idle, 1 = a barrier is forming, 2 = a
//!   stop-the-world section is in progress. The flag is written under the
//!   mutex but read lock-free by `check`, which parks a freshly activated
//!   thread (as `Idle`) until the world resumes.
//!
//! The barrier is used for exactly one thing today: resetting the version
//! clock and rezeroing the lock table when the clock nears the maximum
//! encodable version.

use crate::tx::Status;
use core::sync::atomic::{
    fence, AtomicUsize,
    Ordering::{Acquire, Relaxed, Release, SeqCst},
};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// The part of a thread's transactional state that other threads may
/// observe: its status word, using the canonical encoding (lowest bit set
/// while a transaction is in flight).
#[derive(Debug)]
pub struct ThreadState {
    status: AtomicUsize,
}

impl ThreadState {
    #[inline]
    pub fn new() -> Self {
        ThreadState {
            status: AtomicUsize::new(Status::Idle.as_word()),
        }
    }

    #[inline]
    pub fn status(&self) -> Status {
        Status::from_word(self.status.load(Relaxed))
    }

    #[inline]
    pub fn set_status(&self, status: Status) {
        self.status.store(status.as_word(), Relaxed);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status.load(Acquire) & 1 == 1
    }
}

struct Members {
    threads: Vec<Arc<ThreadState>>,
    /// Registered threads not currently blocked inside `barrier`.
    live: usize,
}

pub struct Quiesce {
    members: Mutex<Members>,
    cond: Condvar,
    flag: AtomicUsize,
}

impl core::fmt::Debug for Quiesce {
    #[cold]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Quiesce")
            .field("flag", &self.flag.load(Relaxed))
            .finish()
    }
}

impl Quiesce {
    pub fn new() -> Self {
        Quiesce {
            members: Mutex::new(Members {
                threads: Vec::new(),
                live: 0,
            }),
            cond: Condvar::new(),
            flag: AtomicUsize::new(0),
        }
    }

    /// Registers a thread's shared state. Called once per thread handle.
    pub fn enter(&self, state: Arc<ThreadState>) {
        let mut members = self.members.lock();
        members.threads.push(state);
        members.live += 1;
    }

    /// Unregisters a thread. The thread must not be in a transaction. Wakes
    /// a barrier in progress, which may have been waiting on this thread.
    pub fn exit(&self, state: &Arc<ThreadState>) {
        debug_assert!(!state.is_active(), "unregistering an active thread");
        let mut members = self.members.lock();
        let before = members.threads.len();
        members.threads.retain(|t| !Arc::ptr_eq(t, state));
        debug_assert!(
            members.threads.len() + 1 == before,
            "unregistering an unknown thread"
        );
        members.live -= 1;
        if self.flag.load(Relaxed) != 0 {
            let _ = self.cond.notify_one();
        }
    }

    /// Blocks until every registered thread has arrived here (or exited);
    /// the last arrival runs `action` alone, then everyone resumes.
    ///
    /// Callers must be outside any transaction. Concurrent callers each
    /// bring an action; exactly one action runs per formed barrier.
    #[inline(never)]
    #[cold]
    pub fn barrier(&self, action: impl FnOnce()) {
        let mut action = Some(action);
        let mut members = self.members.lock();
        members.live -= 1;
        if self.flag.load(Relaxed) == 0 {
            self.flag.store(1, Release);
        }
        while self.flag.load(Relaxed) != 0 {
            if members.live == 0 {
                if let Some(f) = action.take() {
                    f();
                }
                self.flag.store(0, Release);
                let _ = self.cond.notify_all();
            } else {
                self.cond.wait(&mut members);
            }
        }
        members.live += 1;
    }

    /// The cooperative side of a stop-the-world section: a thread that has
    /// just become active parks (as `Idle`) while the flag reads 2, then
    /// restores its status. Called on every transaction start, after the
    /// status flips to active but before any lock is touched.
    #[inline]
    pub fn check(&self, state: &ThreadState) {
        debug_assert!(state.is_active(), "quiescence check outside a transaction");
        // Pairs with the fence in `stop_the_world`: either that caller sees
        // this thread active, or this load sees the flag set.
        fence(SeqCst);
        if self.flag.load(Acquire) == 2 {
            self.check_slow(state);
        }
    }

    #[inline(never)]
    #[cold]
    fn check_slow(&self, state: &ThreadState) {
        let status = state.status();
        state.set_status(Status::Idle);
        let backoff = Backoff::new();
        while self.flag.load(Acquire) == 2 {
            backoff.snooze();
        }
        state.set_status(status);
    }

    /// Runs `f` while no transaction is in flight anywhere.
    ///
    /// Sets the flag to 2 so that transactions starting meanwhile park in
    /// `check`, then spins until every registered thread (except `caller`'s
    /// own, if given) is inactive. In-flight transactions run to their next
    /// commit or abort; they are not interrupted.
    pub fn stop_the_world<R>(&self, caller: Option<&ThreadState>, f: impl FnOnce() -> R) -> R {
        let members = self.members.lock();
        self.flag.store(2, Release);
        // The statuses sampled below must be at least as fresh as the flag.
        fence(SeqCst);
        for t in members.threads.iter() {
            if let Some(caller) = caller {
                if core::ptr::eq(Arc::as_ptr(t), caller) {
                    continue;
                }
            }
            let backoff = Backoff::new();
            while t.is_active() {
                backoff.snooze();
            }
        }
        let r = f();
        self.flag.store(0, Release);
        drop(members);
        r
    }

    /// Blocks until no transaction is in flight, without stopping new ones.
    pub fn wait_inactive(&self) {
        let members = self.members.lock();
        fence(SeqCst);
        for t in members.threads.iter() {
            let backoff = Backoff::new();
            while t.is_active() {
                backoff.snooze();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_utils::thread;

    #[test]
    fn barrier_runs_one_action() {
        let quiesce = Quiesce::new();
        let a = Arc::new(ThreadState::new());
        quiesce.enter(a.clone());
        let mut ran = false;
        quiesce.barrier(|| ran = true);
        assert!(ran, "sole member must run the action itself");
        quiesce.exit(&a);
    }

    #[test]
    fn barrier_waits_for_every_member() {
        let quiesce = Quiesce::new();
        let states: Vec<_> = (0..4).map(|_| Arc::new(ThreadState::new())).collect();
        for s in states.iter() {
            quiesce.enter(s.clone());
        }
        let ran = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|_| {
                    quiesce.barrier(|| {
                        let _ = ran.fetch_add(1, Relaxed);
                    });
                });
            }
        })
        .unwrap();
        assert_eq!(ran.load(Relaxed), 1, "exactly one action per barrier");
        for s in states.iter() {
            quiesce.exit(s);
        }
    }

    #[test]
    fn stop_the_world_waits_for_active_threads() {
        let quiesce = Quiesce::new();
        let busy = Arc::new(ThreadState::new());
        quiesce.enter(busy.clone());
        busy.set_status(Status::Active);
        thread::scope(|scope| {
            let handle = scope.spawn(|_| quiesce.stop_the_world(None, || 42));
            std::thread::sleep(std::time::Duration::from_millis(20));
            busy.set_status(Status::Committed);
            assert_eq!(handle.join().unwrap(), 42);
        })
        .unwrap();
        quiesce.exit(&busy);
    }
}
