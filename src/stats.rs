//! Statistics collection. Enabled with `--features stats`.
//!
//! Counters are recorded into plain thread-local storage and folded into a
//! process-wide accumulator when each thread's storage drops, so the hot
//! paths never synchronize. Without the feature every recorder is an empty
//! inline function.

#[cfg(feature = "stats")]
pub use self::imp::{print_summary, snapshot};

use crate::tx::Reason;

#[inline]
pub(crate) fn commit() {
    #[cfg(feature = "stats")]
    imp::with(|s| s.commits += 1);
}

#[inline]
pub(crate) fn retry() {
    #[cfg(feature = "stats")]
    imp::with(|s| s.retries += 1);
}

#[inline]
pub(crate) fn extension() {
    #[cfg(feature = "stats")]
    imp::with(|s| s.extensions += 1);
}

#[inline]
pub(crate) fn abort(reason: Reason) {
    #[cfg(feature = "stats")]
    imp::with(|s| {
        s.aborts += 1;
        if reason.contains(Reason::RW_CONFLICT) {
            s.rw_conflicts += 1;
        }
        if reason.contains(Reason::WW_CONFLICT) {
            s.ww_conflicts += 1;
        }
        if reason.contains(Reason::VAL_READ) {
            s.failed_reads += 1;
        }
        if reason.contains(Reason::VAL_WRITE) {
            s.failed_writes += 1;
        }
        if reason.contains(Reason::VALIDATE) {
            s.failed_validations += 1;
        }
        if reason.contains(Reason::EXTEND_WS) {
            s.write_log_overflows += 1;
        }
        if reason.contains(Reason::EXPLICIT) {
            s.explicit_aborts += 1;
        }
    });
    #[cfg(not(feature = "stats"))]
    let _ = reason;
}

#[inline]
pub(crate) fn read_set_size(len: usize) {
    #[cfg(feature = "stats")]
    imp::with(|s| s.read_set.record(len as u64));
    #[cfg(not(feature = "stats"))]
    let _ = len;
}

#[inline]
pub(crate) fn write_set_size(len: usize) {
    #[cfg(feature = "stats")]
    imp::with(|s| s.write_set.record(len as u64));
    #[cfg(not(feature = "stats"))]
    let _ = len;
}

#[cfg(feature = "stats")]
mod imp {
    use core::cell::RefCell;
    use parking_lot::Mutex;

    #[derive(Copy, Clone, Default, Debug)]
    pub struct Size {
        pub count: u64,
        pub min: u64,
        pub max: u64,
        pub total: u64,
    }

    impl Size {
        pub(super) fn record(&mut self, size: u64) {
            if self.count == 0 {
                self.min = size;
                self.max = size;
            } else {
                self.min = self.min.min(size);
                self.max = self.max.max(size);
            }
            self.count += 1;
            self.total += size;
        }

        fn merge(&mut self, rhs: &Size) {
            if rhs.count == 0 {
                return;
            }
            if self.count == 0 {
                *self = *rhs;
                return;
            }
            self.count += rhs.count;
            self.min = self.min.min(rhs.min);
            self.max = self.max.max(rhs.max);
            self.total += rhs.total;
        }
    }

    /// A collection of engine statistics.
    #[derive(Copy, Clone, Default, Debug)]
    pub struct Stats {
        pub commits: u64,
        pub retries: u64,
        pub aborts: u64,
        pub extensions: u64,
        pub rw_conflicts: u64,
        pub ww_conflicts: u64,
        pub failed_reads: u64,
        pub failed_writes: u64,
        pub failed_validations: u64,
        pub write_log_overflows: u64,
        pub explicit_aborts: u64,
        pub read_set: Size,
        pub write_set: Size,
    }

    impl Stats {
        fn merge(&mut self, rhs: &Stats) {
            self.commits += rhs.commits;
            self.retries += rhs.retries;
            self.aborts += rhs.aborts;
            self.extensions += rhs.extensions;
            self.rw_conflicts += rhs.rw_conflicts;
            self.ww_conflicts += rhs.ww_conflicts;
            self.failed_reads += rhs.failed_reads;
            self.failed_writes += rhs.failed_writes;
            self.failed_validations += rhs.failed_validations;
            self.write_log_overflows += rhs.write_log_overflows;
            self.explicit_aborts += rhs.explicit_aborts;
            self.read_set.merge(&rhs.read_set);
            self.write_set.merge(&rhs.write_set);
        }
    }

    lazy_static::lazy_static! {
        static ref GLOBAL: Mutex<Stats> = Mutex::new(Stats::default());
    }

    struct ThreadStats(RefCell<Stats>);

    impl Drop for ThreadStats {
        fn drop(&mut self) {
            GLOBAL.lock().merge(&self.0.borrow());
        }
    }

    thread_local! {
        static THREAD: ThreadStats = ThreadStats(RefCell::new(Stats::default()));
    }

    #[inline]
    pub(super) fn with(f: impl FnOnce(&mut Stats)) {
        // Recorders may run during thread teardown; drop the sample then.
        let _ = THREAD.try_with(move |t| f(&mut t.0.borrow_mut()));
    }

    /// The accumulated statistics: everything folded in by finished threads
    /// plus the calling thread's own counters.
    pub fn snapshot() -> Stats {
        let mut stats = *GLOBAL.lock();
        let _ = THREAD.try_with(|t| stats.merge(&t.0.borrow()));
        stats
    }

    /// Prints `snapshot` to stderr.
    pub fn print_summary() {
        eprintln!("{:#?}", snapshot());
    }

}
