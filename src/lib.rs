//! A word-granularity software transactional memory library.
//!
//! `wstm` lets threads execute blocks of shared-memory reads and writes
//! atomically, with optimistic concurrency: conflicts are detected, the
//! losing transaction rolls back, and its body runs again. Committed
//! transactions are strictly serializable.
//!
//! # Examples
//!
//! Creating transactional memory locations:
//! ```
//! use wstm::tword::TWord;
//!
//! static A: TWord = TWord::new(0);
//! let b = TWord::new(42);
//! ```
//!
//! Getting a thread handle on the default engine and swapping two values:
//! ```
//! # use wstm::tword::TWord;
//! # static A: TWord = TWord::new(0);
//! # let b = TWord::new(42);
//! use wstm::stm;
//!
//! let mut thread = stm::global().thread();
//! thread.run(Default::default(), |tx| {
//!     let temp = tx.load(&A)?;
//!     let other = tx.load(&b)?;
//!     tx.store(&A, other)?;
//!     tx.store(&b, temp)?;
//!     Ok(())
//! });
//! assert_eq!(b.into_inner(), 0);
//! ```
//!
//! # Design
//!
//! * Write-back with encounter-time locking: a store takes its lock
//!   immediately but buffers the value, and memory changes only at commit.
//! * Locks live in a shared striped table indexed by address hash; a
//!   [`TWord`](tword::TWord) itself is exactly one machine word.
//! * Reads are invisible and validated against a `[start, end]` snapshot of
//!   a global version clock; a stale read first tries to *extend* the
//!   snapshot by revalidating the read log before giving up.
//! * Retry is abort-and-retry, nothing fancier: the engine identifies
//!   itself as design `"WRITE-BACK (ETL)"` with contention manager
//!   `"SUICIDE"`.
//! * When the version clock approaches its encodable maximum, the engine
//!   stalls the world on a quiescence barrier and rewinds time.
//! * All global state hangs off an [`Stm`](stm::Stm) engine value;
//!   independent engines coexist in one process (see [`stm::global`] for
//!   the default).

#![warn(macro_use_extern_crate)]
#![warn(missing_debug_implementations)]
#![warn(unused_lifetimes)]
#![cfg_attr(not(test), warn(unused_results))]
#![deny(rust_2018_compatibility)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

mod internal;

pub mod stats;
pub mod stm;
pub mod thread;
pub mod tword;
pub mod tx;

pub use crate::{
    stm::Stm,
    thread::{ThreadTx, Tx},
};

/// The unit of transacted memory: an unsigned machine word, pointer sized.
pub type Word = usize;

#[cfg(test)]
mod counter {
    use crate::{stm::Stm, tword::TWord};
    use crossbeam_utils::thread;

    #[test]
    fn concurrent_increments_serialize() {
        const THREAD_COUNT: usize = 8;
        const ITER_COUNT: usize = 1_000;
        let stm = Stm::new();
        let counter = TWord::new(0);
        thread::scope(|s| {
            for _ in 0..THREAD_COUNT {
                s.spawn(|_| {
                    let mut thread = stm.thread();
                    for _ in 0..ITER_COUNT {
                        thread.run(Default::default(), |tx| {
                            let v = tx.load(&counter)?;
                            tx.store(&counter, v + 1)
                        });
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(
            counter.into_inner(),
            THREAD_COUNT * ITER_COUNT,
            "lost updates under concurrent increments"
        );
        // Aborted commits tick the clock too, so it bounds below by the
        // number of successful commits.
        assert!(stm.clock() >= THREAD_COUNT * ITER_COUNT);
    }

    #[test]
    fn read_for_write_increments_serialize() {
        const THREAD_COUNT: usize = 4;
        const ITER_COUNT: usize = 1_000;
        let stm = Stm::new();
        let counter = TWord::new(0);
        thread::scope(|s| {
            for _ in 0..THREAD_COUNT {
                s.spawn(|_| {
                    let mut thread = stm.thread();
                    for _ in 0..ITER_COUNT {
                        thread.run(Default::default(), |tx| {
                            let v = tx.read_for_write(&counter)?;
                            tx.store(&counter, v + 1)
                        });
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(counter.into_inner(), THREAD_COUNT * ITER_COUNT);
    }
}
