//! Per-thread transactional state: the [`ThreadTx`] handle and the
//! in-transaction capability [`Tx`].
//!
//! A transaction body is a closure receiving `&mut Tx`. Aborts - conflicts
//! detected by the engine, or explicit [`Tx::abort`] - surface as
//! [`Abort`] errors that the body routes back to [`ThreadTx::run`] with
//! `?`. By the time the error value exists, the rollback has already
//! happened and the descriptor is re-prepared, so the retry loop simply
//! re-enters the closure: that loop is the transaction's retry
//! continuation.
//!
//! ```
//! use wstm::{stm, tword::TWord};
//!
//! let account = TWord::new(100);
//! let mut thread = stm::global().thread();
//! let balance = thread.run(Default::default(), |tx| {
//!     let v = tx.load(&account)?;
//!     tx.store(&account, v - 30)?;
//!     Ok(v - 30)
//! });
//! assert_eq!(balance, 70);
//! ```

use crate::{
    internal::{descriptor::Descriptor, quiesce::ThreadState},
    stats,
    stm::Stm,
    tword::TWord,
    tx::{Abort, Attr, Reason, Status},
    Word,
};
use core::fmt::{self, Debug, Formatter};
use std::sync::Arc;

/// A thread's handle into an engine.
///
/// Obtained from [`Stm::thread`]. The handle owns the thread's transaction
/// descriptor (status, snapshot, read/write logs); it is deliberately
/// neither `Send` nor `Sync` - one descriptor is driven by one thread.
pub struct ThreadTx<'stm> {
    stm: &'stm Stm,
    desc: Descriptor,
}

impl Debug for ThreadTx<'_> {
    #[cold]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ThreadTx")
            .field("desc", &self.desc)
            .finish()
    }
}

impl<'stm> ThreadTx<'stm> {
    pub(crate) fn new(stm: &'stm Stm) -> Self {
        let state = Arc::new(ThreadState::new());
        stm.quiesce.enter(state.clone());
        stm.mark_started();
        let desc = Descriptor::new(state, stm.config().initial_rw_set_size);
        stm.on_thread_init();
        ThreadTx { stm, desc }
    }

    /// Runs a transaction to successful commit, retrying the body as often
    /// as conflicts demand.
    ///
    /// The borrow of `self` pins every `TWord` the body touches for the
    /// whole transaction, commit included.
    ///
    /// # Panics
    ///
    /// Panics if `attr.no_retry` is set (use [`try_run`]), or if the body
    /// smuggles out an abort whose reason carries [`Reason::NO_RETRY`].
    ///
    /// # Examples
    ///
    /// ```
    /// use wstm::{stm, tword::TWord};
    ///
    /// let x = TWord::new(0);
    /// let mut thread = stm::global().thread();
    /// thread.run(Default::default(), |tx| tx.store(&x, 42));
    /// assert_eq!(x.into_inner(), 42);
    /// ```
    ///
    /// [`try_run`]: ThreadTx::try_run
    #[inline]
    pub fn run<'env, O, F>(&'env mut self, attr: Attr, mut f: F) -> O
    where
        F: FnMut(&mut Tx<'env>) -> Result<O, Abort>,
    {
        assert!(
            !attr.no_retry,
            "`run` loops until commit; `no_retry` transactions go through `try_run`"
        );
        let stm = self.stm;
        let desc = &mut self.desc;
        let outermost = desc.begin(stm, attr);
        debug_assert!(outermost, "`run` started inside another transaction");
        let mut tx = Tx { stm, desc };
        loop {
            let failed = match f(&mut tx) {
                Ok(o) => match tx.desc.commit(stm) {
                    Ok(()) => return o,
                    Err(abort) => abort,
                },
                Err(abort) => abort,
            };
            if failed.reason().contains(Reason::NO_RETRY) {
                panic!("no-retry abort reached `run`; the body must go through `try_run`");
            }
            stats::retry();
        }
    }

    /// Runs a single attempt of a transaction.
    ///
    /// `no_retry` semantics are forced: on abort the descriptor is not
    /// re-prepared, control returns normally with the reason, and
    /// [`aborted`](ThreadTx::aborted) observes the outcome.
    ///
    /// # Examples
    ///
    /// ```
    /// use wstm::{stm, tword::TWord};
    ///
    /// let x = TWord::new(5);
    /// let mut thread = stm::global().thread();
    /// let r = thread.try_run(Default::default(), |tx| tx.load(&x));
    /// assert_eq!(r.unwrap(), 5);
    /// ```
    #[inline]
    pub fn try_run<'env, O, F>(&'env mut self, mut attr: Attr, f: F) -> Result<O, Abort>
    where
        F: FnOnce(&mut Tx<'env>) -> Result<O, Abort>,
    {
        attr.no_retry = true;
        let stm = self.stm;
        let desc = &mut self.desc;
        let outermost = desc.begin(stm, attr);
        debug_assert!(outermost, "`try_run` started inside another transaction");
        let mut tx = Tx { stm, desc };
        match f(&mut tx) {
            Ok(o) => tx.desc.commit(stm).map(|()| o),
            Err(abort) => Err(abort),
        }
    }

    /// True while a transaction is in flight on this handle.
    #[inline]
    pub fn active(&self) -> bool {
        self.desc.state.is_active()
    }

    /// True if the last transaction ended in an abort.
    #[inline]
    pub fn aborted(&self) -> bool {
        self.desc.state.status() == Status::Aborted
    }

    /// True if the transaction was killed. Never produced by this engine;
    /// kept for status-encoding completeness.
    #[inline]
    pub fn killed(&self) -> bool {
        self.desc.state.status() == Status::Killed
    }

    /// The current transaction status.
    #[inline]
    pub fn status(&self) -> Status {
        self.desc.state.status()
    }

    /// The attributes the last transaction ran with.
    #[inline]
    pub fn attributes(&self) -> Attr {
        self.desc.attr
    }

    /// The reason bits the most recent rollback resumed with, if any.
    #[inline]
    pub fn last_abort(&self) -> Option<Reason> {
        self.desc.last_abort()
    }

    /// Per-thread statistics readout by name.
    ///
    /// Recognized names: `"read_set_size"`, `"write_set_size"`,
    /// `"read_set_nb_entries"`, `"write_set_nb_entries"`, `"read_only"`.
    pub fn get_stats(&self, name: &str) -> Option<usize> {
        match name {
            "read_set_size" => Some(self.desc.read_set_capacity()),
            "write_set_size" => Some(self.desc.write_set_capacity()),
            "read_set_nb_entries" => Some(self.desc.read_set_len()),
            "write_set_nb_entries" => Some(self.desc.write_set_len()),
            "read_only" => Some(self.desc.attr.read_only as usize),
            _ => None,
        }
    }
}

impl Drop for ThreadTx<'_> {
    fn drop(&mut self) {
        debug_assert!(
            !self.desc.state.is_active(),
            "thread handle dropped inside a transaction"
        );
        self.stm.on_thread_exit();
        self.stm.quiesce.exit(&self.desc.state);
    }
}

/// The in-transaction capability handed to transaction bodies.
///
/// The `'env` lifetime ties every `TWord` the transaction touches to the
/// enclosing [`ThreadTx::run`] call; a `TWord` created inside the body
/// cannot be transacted on, which is exactly the set of locations the
/// commit may still need after the body returns.
pub struct Tx<'env> {
    stm: &'env Stm,
    pub(crate) desc: &'env mut Descriptor,
}

impl Debug for Tx<'_> {
    #[cold]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Tx")
            .field("desc", &self.desc)
            .finish()
    }
}

impl<'env> Tx<'env> {
    /// Transactionally reads one word.
    ///
    /// Returns the value `word` holds at some point inside this
    /// transaction's snapshot - a value written by this transaction itself,
    /// or the last commit visible to the snapshot.
    ///
    /// # Errors
    ///
    /// Rolls back with [`Reason::RW_CONFLICT`] if another transaction holds
    /// the stripe, or [`Reason::VAL_READ`] if the stripe moved past the
    /// snapshot and the snapshot could not be extended.
    #[inline]
    pub fn load(&mut self, word: &'env TWord) -> Result<Word, Abort> {
        self.desc.load(self.stm, word.word())
    }

    /// Transactionally writes one word. The write is buffered and lands at
    /// commit; the stripe lock is taken now.
    ///
    /// # Errors
    ///
    /// Rolls back with [`Reason::WW_CONFLICT`] if another transaction holds
    /// the stripe, [`Reason::VAL_WRITE`] if this transaction read the
    /// stripe at an older version, or [`Reason::EXTEND_WS`] when the write
    /// log was full (its capacity has been doubled for the retry).
    #[inline]
    pub fn store(&mut self, word: &'env TWord, value: Word) -> Result<(), Abort> {
        self.desc.store(self.stm, word.word(), value, !0)
    }

    /// Like [`store`](Tx::store), but only the bits selected by `mask` are
    /// written; the rest of the word keeps whatever value commit-time
    /// memory holds. Concurrent committers writing disjoint masks of one
    /// word do not clobber each other. A zero mask reserves the stripe
    /// without writing.
    #[inline]
    pub fn store_masked(&mut self, word: &'env TWord, value: Word, mask: Word) -> Result<(), Abort> {
        self.desc.store(self.stm, word.word(), value, mask)
    }

    /// Reserves `word`'s stripe for writing and reads the word directly.
    /// Cheaper than [`load`](Tx::load) followed by [`store`](Tx::store)
    /// when the write is certain.
    #[inline]
    pub fn read_for_write(&mut self, word: &'env TWord) -> Result<Word, Abort> {
        self.desc.read_for_write(self.stm, word.word())
    }

    /// Explicitly aborts the transaction.
    ///
    /// The rollback happens here; the returned error must be propagated to
    /// the retry loop, which re-enters the body.
    #[inline]
    pub fn abort(&mut self) -> Abort {
        self.abort_with(Reason::default())
    }

    /// [`abort`](Tx::abort) with caller reason bits, ORed with
    /// [`Reason::EXPLICIT`]. Including [`Reason::NO_RETRY`] suppresses the
    /// retry; such aborts must be routed through
    /// [`ThreadTx::try_run`].
    #[inline]
    pub fn abort_with(&mut self, reason: Reason) -> Abort {
        self.desc.rollback(self.stm, reason | Reason::EXPLICIT)
    }

    /// Runs `f` as a flat-nested transaction: begin and commit only adjust
    /// the nesting counter, so `f` composes with the enclosing transaction
    /// and an abort anywhere rolls the whole thing back to the outermost
    /// retry point.
    pub fn nested<O>(
        &mut self,
        f: impl FnOnce(&mut Tx<'env>) -> Result<O, Abort>,
    ) -> Result<O, Abort> {
        let attr = self.desc.attr;
        let outermost = self.desc.begin(self.stm, attr);
        debug_assert!(!outermost, "nested begin unexpectedly outermost");
        let r = f(self);
        if r.is_ok() {
            self.desc.commit(self.stm)?;
        }
        r
    }

    /// True when this is the outermost transaction level - the level whose
    /// commit publishes.
    #[inline]
    pub fn is_outermost(&self) -> bool {
        self.desc.nesting == 1
    }

    /// The snapshot validity interval `[start, end]`, in clock units.
    #[inline]
    pub fn snapshot(&self) -> (Word, Word) {
        self.desc.snapshot()
    }

    /// Stores a value in a per-transaction specific slot previously
    /// allocated with [`Stm::create_specific`].
    ///
    /// # Panics
    ///
    /// Panics if `key` was never allocated.
    #[inline]
    pub fn set_specific(&self, key: usize, data: *mut ()) {
        self.desc.set_specific(self.stm, key, data)
    }

    /// Reads a per-transaction specific slot. Slots reset to null only at
    /// descriptor creation; modules own their lifecycle across retries.
    ///
    /// # Panics
    ///
    /// Panics if `key` was never allocated.
    #[inline]
    pub fn get_specific(&self, key: usize) -> *mut () {
        self.desc.get_specific(self.stm, key)
    }
}
