//! The read log: every optimistic read appends the lock it sampled and the
//! version it observed.
//!
//! Validation re-loads each recorded lock and accepts it if the lock is
//! still free at the recorded version, or if it is owned by the validating
//! transaction itself (its owner pointer falls inside the transaction's own
//! write log). Anything else means a concurrent committer has moved past the
//! snapshot.

use crate::{internal::{alloc::FVec, lockword}, Word};
use core::sync::atomic::{AtomicUsize, Ordering::Acquire};

#[derive(Debug)]
pub struct ReadEntry {
    pub lock: *const AtomicUsize,
    pub version: Word,
}

#[derive(Debug)]
pub struct ReadLog {
    entries: FVec<ReadEntry>,
}

impl ReadLog {
    #[inline]
    pub fn new(capacity: usize) -> Self {
        ReadLog {
            entries: FVec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear()
    }

    /// Records an observed `(lock, version)` pair, growing the backing
    /// storage if needed. The read log holds no published pointers, so
    /// growing it mid-transaction is harmless.
    #[inline]
    pub fn push(&mut self, lock: *const AtomicUsize, version: Word) {
        if self.entries.next_push_allocates() {
            self.entries.grow_double();
        }
        unsafe { self.entries.push_unchecked(ReadEntry { lock, version }) }
    }

    /// Linear scan for a prior read of `lock`. Cold: only the store path
    /// consults it, and only when it sees a version newer than the snapshot.
    #[inline(never)]
    pub fn has_read(&self, lock: *const AtomicUsize) -> bool {
        self.entries.iter().any(|r| r.lock == lock)
    }

    /// Revalidates every recorded read against the current lock states.
    ///
    /// `write_span` is the validating transaction's own write-log storage
    /// range, used to recognize self-owned locks by address alone.
    #[inline]
    pub fn validate(&self, write_span: (usize, usize)) -> bool {
        let (ws_base, ws_end) = write_span;
        for r in self.entries.iter() {
            let l = unsafe { (*r.lock).load(Acquire) };
            if lockword::is_owned(l) {
                let w = lockword::owner(l);
                if !(ws_base <= w && w < ws_end) {
                    // Owned by somebody else: the stripe moved under us.
                    return false;
                }
            } else if lockword::timestamp(l) != r.version {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::ReadLog;
    use crate::internal::lockword;
    use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};

    #[test]
    fn validate_accepts_unchanged_versions() {
        let lock = AtomicUsize::new(lockword::set_timestamp(3));
        let mut log = ReadLog::new(4);
        log.push(&lock, 3);
        assert!(log.validate((0, 0)));
    }

    #[test]
    fn validate_rejects_moved_versions() {
        let lock = AtomicUsize::new(lockword::set_timestamp(3));
        let mut log = ReadLog::new(4);
        log.push(&lock, 3);
        lock.store(lockword::set_timestamp(4), Relaxed);
        assert!(!log.validate((0, 0)));
    }

    #[test]
    fn validate_distinguishes_owners() {
        let entry_addr = 0x1000usize;
        let lock = AtomicUsize::new(lockword::set_owned(entry_addr));
        let mut log = ReadLog::new(4);
        log.push(&lock, 3);
        assert!(
            log.validate((0x1000, 0x2000)),
            "self-owned lock should validate"
        );
        assert!(
            !log.validate((0x4000, 0x5000)),
            "foreign-owned lock should not validate"
        );
    }

    #[test]
    fn has_read_finds_only_recorded_locks() {
        let a = AtomicUsize::new(0);
        let b = AtomicUsize::new(0);
        let mut log = ReadLog::new(4);
        log.push(&a, 0);
        assert!(log.has_read(&a));
        assert!(!log.has_read(&b));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let lock = AtomicUsize::new(0);
        let mut log = ReadLog::new(2);
        for i in 0..64 {
            log.push(&lock, i);
        }
        assert_eq!(log.len(), 64);
        assert!(log.capacity() >= 64);
    }
}
