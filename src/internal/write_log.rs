//! The write log: the redo buffer of a transaction and the object that lock
//! words point at while the transaction owns them.
//!
//! Each entry records one application word (`addr`), the pending value and
//! write mask, the version the covering lock held when it was acquired, and
//! the lock itself. Entries whose addresses hash onto the same lock form a
//! *bucket*: a singly linked list threaded through `next`, appended at the
//! tail. The covering lock word stores the address of the bucket's first
//! entry, so entries are 16-byte aligned and the storage never reallocates
//! while any lock is held - a full log forces an abort, and the capacity is
//! doubled only from the rollback path once every lock has been dropped.

use crate::{
    internal::{
        alloc::FVec,
        lockword::{self, ENTRY_ALIGN},
    },
    Word,
};
use core::sync::atomic::{
    fence, AtomicUsize,
    Ordering::{Acquire, Relaxed, Release},
};

#[repr(align(16))]
pub struct WriteEntry {
    pub addr: *const AtomicUsize,
    pub value: Word,
    pub mask: Word,
    pub version: Word,
    pub lock: *const AtomicUsize,
    pub next: *mut WriteEntry,
}

impl core::fmt::Debug for WriteEntry {
    #[cold]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WriteEntry")
            .field("addr", &self.addr)
            .field("mask", &self.mask)
            .field("version", &self.version)
            .field("tail", &self.next.is_null())
            .finish()
    }
}

/// Outcome of searching a bucket during a repeat store.
pub enum BucketSearch {
    /// The address was already buffered; the pending value was merged.
    Merged,
    /// The address is new to the bucket. `prev` is the current tail and
    /// `version` the lock version shared by every entry under this lock.
    Tail {
        prev: *mut WriteEntry,
        version: Word,
    },
}

pub struct WriteLog {
    entries: FVec<WriteEntry>,
    has_writes: usize,
}

impl core::fmt::Debug for WriteLog {
    #[cold]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WriteLog")
            .field("entries", &self.entries)
            .field("has_writes", &self.has_writes)
            .finish()
    }
}

impl WriteLog {
    #[inline]
    pub fn new(capacity: usize) -> Self {
        let log = WriteLog {
            entries: FVec::with_capacity(capacity),
            has_writes: 0,
        };
        debug_assert!(
            log.entries.as_ptr() as usize % ENTRY_ALIGN == 0,
            "write-log storage insufficiently aligned for the lock encoding"
        );
        log
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
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.entries.next_push_allocates()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear();
        self.has_writes = 0;
    }

    /// The storage range `[base, end)` of the live entries, compared against
    /// owner pointers recovered from lock words to decide "is this lock
    /// ours" without dereferencing anything.
    #[inline]
    pub fn span(&self) -> (usize, usize) {
        let base = self.entries.as_ptr() as usize;
        (
            base,
            base + self.entries.len() * core::mem::size_of::<WriteEntry>(),
        )
    }

    /// Does an owner pointer recovered from a lock word land in this log?
    #[inline]
    pub fn owns(&self, entry_addr: usize) -> bool {
        let (base, end) = self.span();
        base <= entry_addr && entry_addr < end
    }

    /// Address of the slot the next `append` will fill. This is the value
    /// CASed into a free lock *before* the entry is populated; it must not
    /// be dereferenced until `append` returns.
    #[inline]
    pub fn next_entry_addr(&self) -> usize {
        debug_assert!(!self.is_full(), "reserving an entry in a full write log");
        self.entries.as_ptr() as usize + self.entries.len() * core::mem::size_of::<WriteEntry>()
    }

    /// Populates the reserved slot and links it behind `prev` when the lock
    /// already covers earlier entries of this transaction.
    ///
    /// With a partial mask the untouched bits are seeded from memory now, so
    /// commit can publish the buffered word verbatim. A zero mask reserves
    /// the lock without buffering a value.
    ///
    /// # Safety
    ///
    /// `addr` and `lock` must be live for the duration of the transaction,
    /// and `prev` must be null or point into this log.
    #[inline]
    pub unsafe fn append(
        &mut self,
        addr: *const AtomicUsize,
        value: Word,
        mask: Word,
        version: Word,
        lock: *const AtomicUsize,
        prev: *mut WriteEntry,
    ) -> *mut WriteEntry {
        debug_assert!(!self.is_full(), "appending to a full write log");
        let value = if mask == 0 {
            0
        } else if mask != !0 {
            ((*addr).load(Acquire) & !mask) | (value & mask)
        } else {
            value
        };
        self.entries.push_unchecked(WriteEntry {
            addr,
            value,
            mask,
            version,
            lock,
            next: core::ptr::null_mut(),
        });
        let w = self.entries.as_mut_ptr().add(self.entries.len() - 1);
        if !prev.is_null() {
            (*prev).next = w;
        }
        self.has_writes += 1;
        w
    }

    /// Walks the bucket rooted at `head` for a repeat store. Merges into an
    /// existing entry for `addr`, or reports the tail to link a new entry
    /// behind.
    ///
    /// # Safety
    ///
    /// `head` must point into this log (checked by the caller via `owns`).
    pub unsafe fn bucket_store(
        &mut self,
        head: usize,
        addr: *const AtomicUsize,
        value: Word,
        mask: Word,
    ) -> BucketSearch {
        debug_assert!(mask != 0, "bucket_store with an empty mask");
        let mut prev = head as *mut WriteEntry;
        loop {
            let e = &mut *prev;
            if e.addr == addr {
                let mut value = value;
                if mask != !0 {
                    if e.mask == 0 {
                        // Reserved entry: seed the untouched bits from memory.
                        e.value = (*addr).load(Acquire);
                    }
                    value = (e.value & !mask) | (value & mask);
                }
                e.value = value;
                e.mask |= mask;
                return BucketSearch::Merged;
            }
            if e.next.is_null() {
                return BucketSearch::Tail {
                    prev,
                    version: e.version,
                };
            }
            prev = e.next;
        }
    }

    /// Reads `addr` as seen by this transaction: the buffered value if the
    /// bucket holds a real write for it, the memory word otherwise.
    ///
    /// # Safety
    ///
    /// `head` must point into this log and `addr` must be live.
    pub unsafe fn bucket_read(&self, head: usize, addr: *const AtomicUsize) -> Word {
        let mut w = head as *const WriteEntry;
        loop {
            let e = &*w;
            if e.addr == addr {
                return if e.mask == 0 {
                    (*addr).load(Acquire)
                } else {
                    e.value
                };
            }
            if e.next.is_null() {
                // Same stripe, different word: fall through to memory.
                return (*addr).load(Acquire);
            }
            w = e.next;
        }
    }

    /// Publishes every buffered value and releases each lock once, at its
    /// bucket tail, with the commit timestamp `t`.
    ///
    /// Earlier entries' locks stay held until the tail's value has landed:
    /// the lock word points at *some* entry of the bucket, and a reader that
    /// found it owned walks the whole list. The release store on the lock is
    /// what makes the plain value stores visible.
    ///
    /// # Safety
    ///
    /// Every `addr` and `lock` recorded in the log must still be live, and
    /// the calling transaction must own every recorded lock.
    pub unsafe fn publish(&self, t: Word) {
        for e in self.entries.iter() {
            if e.mask != 0 {
                (*e.addr).store(e.value, Relaxed);
            }
            if e.next.is_null() {
                (*e.lock).store(lockword::set_timestamp(t), Release);
            }
        }
    }

    /// Restores every owned lock to its captured pre-transaction version.
    /// Like `publish`, each lock is touched exactly once, at its bucket
    /// tail. No bit outside the version field changes.
    ///
    /// # Safety
    ///
    /// The calling transaction must own every recorded lock.
    pub unsafe fn drop_locks(&self) {
        if self.entries.is_empty() {
            return;
        }
        for e in self.entries.iter() {
            if e.next.is_null() {
                (*e.lock).store(lockword::set_timestamp(e.version), Relaxed);
            }
        }
        // Lock releases must be visible before the status changes hands.
        fence(Release);
    }

    /// Doubles the capacity. Only callable once every lock has been dropped;
    /// the entries move, so any owner pointer still in a lock word would
    /// dangle.
    #[inline(never)]
    #[cold]
    pub fn grow(&mut self) {
        self.entries.grow_double();
    }
}
