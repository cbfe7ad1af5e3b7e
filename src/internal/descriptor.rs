//! The per-thread transaction descriptor and the engine operations that run
//! against it: optimistic load, encounter-time-locking store, snapshot
//! extension, commit, and rollback.
//!
//! A transaction's reads are *invisible*: nothing in shared memory records
//! them. Consistency comes from the `[start, end]` snapshot interval. Every
//! version observed so far is `<= end`; when a read encounters a newer
//! version, the snapshot is extended by revalidating the whole read log
//! against the current clock. Writes take their stripe lock at first
//! encounter by CASing the lock word from the free version to a pointer at
//! the new write-log entry, and are published at commit in write-back
//! style.
//!
//! Memory ordering discipline, load-to-publish:
//! - every lock load and every value load is acquire;
//! - the free -> owned CAS is a full barrier;
//! - commit stores the buffered values relaxed, then releases each lock
//!   with a release store of the new version, which is what publishes the
//!   values;
//! - rollback restores versions relaxed and ends with a release fence.

use crate::{
    internal::{
        lockword::{self, VERSION_MAX},
        quiesce::ThreadState,
        read_log::ReadLog,
        write_log::{BucketSearch, WriteLog},
    },
    stats,
    stm::{Stm, MAX_SPECIFIC},
    tx::{Abort, Attr, Reason, Status},
    Word,
};
use core::{
    cell::Cell,
    ptr,
    sync::atomic::{AtomicUsize, Ordering::Acquire},
};
use crossbeam_utils::Backoff;
use std::sync::Arc;

pub struct Descriptor {
    pub state: Arc<ThreadState>,
    pub attr: Attr,
    start: Word,
    end: Word,
    read_log: ReadLog,
    write_log: WriteLog,
    pub nesting: u32,
    specific: [Cell<*mut ()>; MAX_SPECIFIC],
    last_abort: Option<Reason>,
}

impl core::fmt::Debug for Descriptor {
    #[cold]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Descriptor")
            .field("status", &self.state.status())
            .field("snapshot", &(self.start..=self.end))
            .field("reads", &self.read_log.len())
            .field("writes", &self.write_log.len())
            .field("nesting", &self.nesting)
            .finish()
    }
}

impl Descriptor {
    pub fn new(state: Arc<ThreadState>, set_capacity: usize) -> Self {
        const NIL: Cell<*mut ()> = Cell::new(ptr::null_mut());
        Descriptor {
            state,
            attr: Attr::default(),
            start: 0,
            end: 0,
            read_log: ReadLog::new(set_capacity),
            write_log: WriteLog::new(set_capacity),
            nesting: 0,
            specific: [NIL; MAX_SPECIFIC],
            last_abort: None,
        }
    }

    /// Starts a transaction. Nesting is flat: only the outermost call (the
    /// one that returns true) snapshots the clock and fires the start
    /// callbacks; inner calls merely bump the counter.
    pub fn begin(&mut self, stm: &Stm, attr: Attr) -> bool {
        self.nesting += 1;
        if self.nesting > 1 {
            return false;
        }
        self.attr = attr;
        self.prepare(stm);
        stm.on_start();
        true
    }

    /// Resets the descriptor for a (re)start: clears both logs, snapshots
    /// the clock, and flips the status to active. If the clock has run past
    /// the largest encodable version, joins the quiescence barrier whose
    /// last arrival rewinds time: clock to zero, every lock version to
    /// zero. A freshly active transaction also yields here to any
    /// stop-the-world section in progress.
    pub fn prepare(&mut self, stm: &Stm) {
        self.write_log.clear();
        self.read_log.clear();
        loop {
            let now = stm.clock.now();
            self.start = now;
            self.end = now;
            if now < VERSION_MAX {
                break;
            }
            stm.quiesce.barrier(|| {
                stm.clock.reset();
                stm.locks.reset_all();
            });
        }
        self.state.set_status(Status::Active);
        stm.quiesce.check(&self.state);
    }

    /// Optimistically reads one word within the snapshot.
    ///
    /// A lock owned by this transaction routes through its own bucket
    /// (reads-after-writes never enter the read log); a lock owned by
    /// anyone else is an immediate conflict. On the free path the value is
    /// sandwiched between two lock loads so that the observed value is the
    /// one the observed version covers.
    pub fn load(&mut self, stm: &Stm, addr: *const AtomicUsize) -> Result<Word, Abort> {
        debug_assert!(self.state.is_active(), "load outside a transaction");
        let lock = stm.locks.lock_for(addr as usize);
        let mut l = lock.load(Acquire);
        loop {
            if lockword::is_owned(l) {
                let head = lockword::owner(l);
                if self.write_log.owns(head) {
                    return Ok(unsafe { self.write_log.bucket_read(head, addr) });
                }
                return Err(self.rollback(stm, Reason::RW_CONFLICT));
            }
            let value = unsafe { (*addr).load(Acquire) };
            let l2 = lock.load(Acquire);
            if l2 != l {
                l = l2;
                continue;
            }
            let version = lockword::timestamp(l);
            if version > self.end {
                if self.attr.read_only || !self.extend(stm) {
                    return Err(self.rollback(stm, Reason::VAL_READ));
                }
                // The version may have been overwritten while extending: this
                // read is not in the read log yet, so validation did not
                // cover it.
                let l2 = lock.load(Acquire);
                if l2 != l {
                    l = l2;
                    continue;
                }
            }
            if !self.attr.read_only {
                self.read_log.push(lock, version);
            }
            return Ok(value);
        }
    }

    /// Buffers a masked store, acquiring the stripe lock at first encounter.
    ///
    /// `mask` selects the bits written; a zero mask reserves the lock
    /// without touching memory. Repeat stores under an owned lock merge in
    /// place or append to the bucket tail, reusing the version captured
    /// when the lock was acquired.
    pub fn store(
        &mut self,
        stm: &Stm,
        addr: *const AtomicUsize,
        value: Word,
        mask: Word,
    ) -> Result<(), Abort> {
        debug_assert!(self.state.is_active(), "store outside a transaction");
        debug_assert!(!self.attr.read_only, "store in a read-only transaction");
        let lock = stm.locks.lock_for(addr as usize);
        let mut l = lock.load(Acquire);
        let backoff = Backoff::new();
        loop {
            if lockword::is_owned(l) {
                let head = lockword::owner(l);
                if !self.write_log.owns(head) {
                    return Err(self.rollback(stm, Reason::WW_CONFLICT));
                }
                if mask == 0 {
                    // The lock is already reserved; nothing to buffer.
                    return Ok(());
                }
                match unsafe { self.write_log.bucket_store(head, addr, value, mask) } {
                    BucketSearch::Merged => return Ok(()),
                    BucketSearch::Tail { prev, version } => {
                        if self.write_log.is_full() {
                            return Err(self.rollback(stm, Reason::EXTEND_WS));
                        }
                        let _ = unsafe {
                            self.write_log.append(addr, value, mask, version, lock, prev)
                        };
                        return Ok(());
                    }
                }
            }
            let version = lockword::timestamp(l);
            if version > self.end && self.read_log.has_read(lock) {
                // We read this stripe at an older version; overwriting it
                // now could never validate.
                return Err(self.rollback(stm, Reason::VAL_WRITE));
            }
            if self.write_log.is_full() {
                return Err(self.rollback(stm, Reason::EXTEND_WS));
            }
            let slot = self.write_log.next_entry_addr();
            match lock.compare_exchange(
                l,
                lockword::set_owned(slot),
                core::sync::atomic::Ordering::SeqCst,
                Acquire,
            ) {
                Ok(_) => {
                    let _ = unsafe {
                        self.write_log
                            .append(addr, value, mask, version, lock, ptr::null_mut())
                    };
                    return Ok(());
                }
                Err(current) => {
                    l = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Reserves the stripe for writing, then reads the word directly from
    /// memory - safe because the lock is now held.
    pub fn read_for_write(&mut self, stm: &Stm, addr: *const AtomicUsize) -> Result<Word, Abort> {
        self.store(stm, addr, 0, 0)?;
        Ok(unsafe { (*addr).load(Acquire) })
    }

    /// Raises `end` to the current clock if every recorded read still
    /// holds. Failure leaves the snapshot untouched.
    fn extend(&mut self, stm: &Stm) -> bool {
        let now = stm.clock.now();
        if self.validate() {
            stats::extension();
            self.end = now;
            true
        } else {
            false
        }
    }

    #[inline]
    fn validate(&self) -> bool {
        self.read_log.validate(self.write_log.span())
    }

    /// Attempts to commit. Returns `Err` when the transaction rolled back
    /// instead; like every abort, the rollback has already re-prepared the
    /// descriptor for a retry unless retries are suppressed.
    pub fn commit(&mut self, stm: &Stm) -> Result<(), Abort> {
        debug_assert!(self.nesting > 0, "commit without a matching begin");
        self.nesting -= 1;
        if self.nesting > 0 {
            return Ok(());
        }
        stm.on_precommit();
        debug_assert!(self.state.is_active(), "commit outside a transaction");
        if !self.write_log.is_empty() {
            // The commit timestamp; may overshoot VERSION_MAX by at most one
            // tick per live thread before the rollover barrier gates begin.
            let t = stm.clock.fetch_and_tick() + 1;
            if self.start != t - 1 && !self.validate() {
                return Err(self.rollback(stm, Reason::VALIDATE));
            }
            unsafe { self.write_log.publish(t) };
        }
        self.state.set_status(Status::Committed);
        stats::commit();
        stats::read_set_size(self.read_log.len());
        stats::write_set_size(self.write_log.len());
        stm.on_commit();
        Ok(())
    }

    /// Tears the transaction down: drops every owned lock back to its
    /// captured version, runs the abort callbacks, and - unless retries are
    /// suppressed - re-prepares the descriptor so the caller's retry loop
    /// can re-enter the body. The returned `Abort` carries the reason bits
    /// the retry path observes.
    #[inline(never)]
    #[cold]
    pub fn rollback(&mut self, stm: &Stm, reason: Reason) -> Abort {
        debug_assert!(self.state.is_active(), "rollback outside a transaction");
        unsafe { self.write_log.drop_locks() };
        self.state.set_status(Status::Aborted);
        stats::abort(reason);
        if reason == Reason::EXTEND_WS {
            self.write_log.grow();
        }
        self.nesting = 1;
        stm.on_abort();
        if self.attr.no_retry || reason.contains(Reason::NO_RETRY) {
            self.nesting = 0;
            self.last_abort = Some(reason);
            return Abort::new(reason);
        }
        self.prepare(stm);
        let reason = reason | Reason::PATH_INSTRUMENTED;
        self.last_abort = Some(reason);
        Abort::new(reason)
    }

    pub fn last_abort(&self) -> Option<Reason> {
        self.last_abort
    }

    pub fn snapshot(&self) -> (Word, Word) {
        (self.start, self.end)
    }

    pub fn read_set_len(&self) -> usize {
        self.read_log.len()
    }

    pub fn read_set_capacity(&self) -> usize {
        self.read_log.capacity()
    }

    pub fn write_set_len(&self) -> usize {
        self.write_log.len()
    }

    pub fn write_set_capacity(&self) -> usize {
        self.write_log.capacity()
    }

    pub fn set_specific(&self, stm: &Stm, key: usize, data: *mut ()) {
        assert!(key < stm.specific_slots(), "unallocated specific slot");
        self.specific[key].set(data);
    }

    pub fn get_specific(&self, stm: &Stm, key: usize) -> *mut () {
        assert!(key < stm.specific_slots(), "unallocated specific slot");
        self.specific[key].get()
    }
}
