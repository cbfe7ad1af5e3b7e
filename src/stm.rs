//! The engine context [`Stm`]: the shared state one transactional "world"
//! consists of.
//!
//! An engine owns the striped lock table, the global version clock, the
//! quiescence machinery, and the module callback tables. Independent
//! engines are fully isolated - a `TWord` is not tied to an engine, but all
//! threads that share data must of course transact through the same one.
//! Most programs use the process-wide [`global`] engine.
//!
//! # Examples
//!
//! ```
//! use wstm::{stm, tword::TWord};
//!
//! let x = TWord::new(0);
//! let mut thread = stm::global().thread();
//! thread.run(Default::default(), |tx| {
//!     let v = tx.load(&x)?;
//!     tx.store(&x, v + 1)
//! });
//! assert_eq!(x.into_inner(), 1);
//! ```

use crate::{
    internal::{clock::GlobalClock, lockword::LockTable, quiesce::Quiesce},
    thread::ThreadTx,
    tx::Parameter,
    Word,
};
use core::{
    fmt::{self, Debug, Formatter},
    sync::atomic::{
        AtomicBool, AtomicUsize,
        Ordering::Relaxed,
    },
};
use parking_lot::RwLock;

/// Number of per-transaction key-value slots available to modules.
pub const MAX_SPECIFIC: usize = 7;

/// Maximum number of registered callbacks per hook.
pub const MAX_CB: usize = 7;

/// Initial capacity of the read and write logs.
pub const RW_SET_SIZE: usize = 4096;

/// log2 of the number of lock words in the table.
pub const LOCK_ARRAY_LOG_SIZE: u32 = 20;

/// Extra address bits shifted away before indexing the lock table; adjacent
/// words share a stripe.
pub const LOCK_SHIFT_EXTRA: u32 = 2;

/// Engine sizing knobs. The defaults match the canonical build; tests
/// shrink the lock table to force stripe collisions on purpose.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub lock_array_log_size: u32,
    pub lock_shift_extra: u32,
    pub initial_rw_set_size: usize,
}

impl Default for Config {
    #[inline]
    fn default() -> Config {
        Config {
            lock_array_log_size: LOCK_ARRAY_LOG_SIZE,
            lock_shift_extra: LOCK_SHIFT_EXTRA,
            initial_rw_set_size: RW_SET_SIZE,
        }
    }
}

/// A module callback. Arguments live in the closure's captures.
pub type Callback = Box<dyn Fn() + Send + Sync>;

/// A set of module callbacks registered in one [`Stm::register`] call.
/// Hooks left as `None` are skipped.
#[derive(Default)]
pub struct Module {
    pub on_thread_init: Option<Callback>,
    pub on_thread_exit: Option<Callback>,
    pub on_start: Option<Callback>,
    pub on_precommit: Option<Callback>,
    pub on_commit: Option<Callback>,
    pub on_abort: Option<Callback>,
}

impl Debug for Module {
    #[cold]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.pad("Module { .. }")
    }
}

#[derive(Default)]
struct CallbackTables {
    thread_init: Vec<Callback>,
    thread_exit: Vec<Callback>,
    start: Vec<Callback>,
    precommit: Vec<Callback>,
    commit: Vec<Callback>,
    abort: Vec<Callback>,
}

/// A transactional memory engine.
pub struct Stm {
    pub(crate) locks: LockTable,
    pub(crate) clock: GlobalClock,
    pub(crate) quiesce: Quiesce,
    callbacks: RwLock<CallbackTables>,
    /// Cheap gate in front of the callback tables; hooks fire on every
    /// begin/commit and almost no program registers a module.
    any_callbacks: AtomicBool,
    nb_specific: AtomicUsize,
    started: AtomicBool,
    config: Config,
}

impl Debug for Stm {
    #[cold]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Stm")
            .field("clock", &self.clock.now())
            .field("config", &self.config)
            .finish()
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL: Stm = Stm::new();
}

/// The process-wide default engine, initialized on first use.
#[inline]
pub fn global() -> &'static Stm {
    &GLOBAL
}

impl Default for Stm {
    #[inline]
    fn default() -> Stm {
        Stm::new()
    }
}

impl Stm {
    /// Creates an engine with the default [`Config`].
    pub fn new() -> Stm {
        Stm::with_config(Config::default())
    }

    /// Creates an engine with explicit sizing. The lock table is allocated
    /// eagerly (`2^lock_array_log_size` words).
    pub fn with_config(config: Config) -> Stm {
        Stm {
            locks: LockTable::new(config.lock_array_log_size, config.lock_shift_extra),
            clock: GlobalClock::new(),
            quiesce: Quiesce::new(),
            callbacks: RwLock::new(CallbackTables::default()),
            any_callbacks: AtomicBool::new(false),
            nb_specific: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            config,
        }
    }

    /// Enters the calling thread into the engine, returning the handle all
    /// transactional work goes through. Fires the thread-init callbacks.
    /// Dropping the handle leaves the engine (and fires thread-exit
    /// callbacks); the handle must not be dropped mid-transaction.
    pub fn thread(&self) -> ThreadTx<'_> {
        ThreadTx::new(self)
    }

    /// Current value of the global version clock.
    #[inline]
    pub fn clock(&self) -> Word {
        self.clock.now()
    }

    /// Registers a module's callbacks. Returns `false` without registering
    /// anything if a requested hook table is full or if a thread has
    /// already entered the engine - modules must be installed before any
    /// transactional activity.
    pub fn register(&self, module: Module) -> bool {
        if self.started.load(Relaxed) {
            return false;
        }
        let mut tables = self.callbacks.write();
        let full = |table: &Vec<Callback>, cb: &Option<Callback>| {
            cb.is_some() && table.len() >= MAX_CB
        };
        if full(&tables.thread_init, &module.on_thread_init)
            || full(&tables.thread_exit, &module.on_thread_exit)
            || full(&tables.start, &module.on_start)
            || full(&tables.precommit, &module.on_precommit)
            || full(&tables.commit, &module.on_commit)
            || full(&tables.abort, &module.on_abort)
        {
            return false;
        }
        let mut any = false;
        let mut install = |table: &mut Vec<Callback>, cb: Option<Callback>| {
            if let Some(cb) = cb {
                table.push(cb);
                any = true;
            }
        };
        install(&mut tables.thread_init, module.on_thread_init);
        install(&mut tables.thread_exit, module.on_thread_exit);
        install(&mut tables.start, module.on_start);
        install(&mut tables.precommit, module.on_precommit);
        install(&mut tables.commit, module.on_commit);
        install(&mut tables.abort, module.on_abort);
        if any {
            self.any_callbacks.store(true, Relaxed);
        }
        true
    }

    /// Allocates a per-transaction specific slot, usable with
    /// [`Tx::set_specific`](crate::thread::Tx::set_specific). Returns `None`
    /// once all [`MAX_SPECIFIC`] slots are taken.
    pub fn create_specific(&self) -> Option<usize> {
        let mut n = self.nb_specific.load(Relaxed);
        loop {
            if n >= MAX_SPECIFIC {
                return None;
            }
            match self
                .nb_specific
                .compare_exchange(n, n + 1, Relaxed, Relaxed)
            {
                Ok(_) => return Some(n),
                Err(current) => n = current,
            }
        }
    }

    /// Engine parameter readout by name.
    ///
    /// Recognized names: `"contention_manager"`, `"design"`,
    /// `"initial_rw_set_size"`. (`"compile_flags"` is recognized only in
    /// builds that record them; this one does not.)
    pub fn get_parameter(&self, name: &str) -> Option<Parameter> {
        match name {
            "contention_manager" => Some(Parameter::Str("SUICIDE")),
            "design" => Some(Parameter::Str("WRITE-BACK (ETL)")),
            "initial_rw_set_size" => Some(Parameter::Usize(self.config.initial_rw_set_size)),
            _ => None,
        }
    }

    /// Blocks until no transaction is in flight on any thread of this
    /// engine. New transactions are not prevented from starting.
    pub fn wait_quiescence(&self) {
        self.quiesce.wait_inactive();
    }

    /// Runs `f` while the world is stopped: every in-flight transaction has
    /// finished and transactions beginning meanwhile park until `f`
    /// returns. Must not be called from inside a transaction.
    pub fn stop_the_world<R>(&self, f: impl FnOnce() -> R) -> R {
        self.quiesce.stop_the_world(None, f)
    }

    #[inline]
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub(crate) fn specific_slots(&self) -> usize {
        self.nb_specific.load(Relaxed)
    }

    #[inline]
    pub(crate) fn mark_started(&self) {
        self.started.store(true, Relaxed);
    }

    #[inline]
    pub(crate) fn on_thread_init(&self) {
        if self.any_callbacks.load(Relaxed) {
            for f in &self.callbacks.read().thread_init {
                f();
            }
        }
    }

    #[inline]
    pub(crate) fn on_thread_exit(&self) {
        if self.any_callbacks.load(Relaxed) {
            for f in &self.callbacks.read().thread_exit {
                f();
            }
        }
    }

    #[inline]
    pub(crate) fn on_start(&self) {
        if self.any_callbacks.load(Relaxed) {
            for f in &self.callbacks.read().start {
                f();
            }
        }
    }

    #[inline]
    pub(crate) fn on_precommit(&self) {
        if self.any_callbacks.load(Relaxed) {
            for f in &self.callbacks.read().precommit {
                f();
            }
        }
    }

    #[inline]
    pub(crate) fn on_commit(&self) {
        if self.any_callbacks.load(Relaxed) {
            for f in &self.callbacks.read().commit {
                f();
            }
        }
    }

    #[inline]
    pub(crate) fn on_abort(&self) {
        if self.any_callbacks.load(Relaxed) {
            for f in &self.callbacks.read().abort {
                f();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{internal::lockword::VERSION_MAX, tword::TWord, tx::Attr};
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    #[test]
    fn parameters() {
        let stm = Stm::new();
        assert_eq!(
            stm.get_parameter("design"),
            Some(Parameter::Str("WRITE-BACK (ETL)"))
        );
        assert_eq!(
            stm.get_parameter("contention_manager"),
            Some(Parameter::Str("SUICIDE"))
        );
        assert_eq!(
            stm.get_parameter("initial_rw_set_size"),
            Some(Parameter::Usize(RW_SET_SIZE))
        );
        assert_eq!(stm.get_parameter("compile_flags"), None);
        assert_eq!(stm.get_parameter("nonsense"), None);
    }

    #[test]
    fn specific_slots_are_bounded() {
        let stm = Stm::new();
        for expected in 0..MAX_SPECIFIC {
            assert_eq!(stm.create_specific(), Some(expected));
        }
        assert_eq!(stm.create_specific(), None);
    }

    #[test]
    fn callback_tables_are_bounded() {
        let stm = Stm::new();
        for _ in 0..MAX_CB {
            assert!(stm.register(Module {
                on_commit: Some(Box::new(|| {})),
                ..Module::default()
            }));
        }
        assert!(
            !stm.register(Module {
                on_commit: Some(Box::new(|| {})),
                ..Module::default()
            }),
            "an eighth commit callback must be refused"
        );
        // Other hooks still have room.
        assert!(stm.register(Module {
            on_abort: Some(Box::new(|| {})),
            ..Module::default()
        }));
    }

    #[test]
    fn registration_closes_once_threads_exist() {
        let stm = Stm::new();
        drop(stm.thread());
        assert!(!stm.register(Module {
            on_commit: Some(Box::new(|| {})),
            ..Module::default()
        }));
    }

    #[test]
    fn callbacks_fire_in_order() {
        static STARTS: AtomicUsize = AtomicUsize::new(0);
        static COMMITS: AtomicUsize = AtomicUsize::new(0);
        static ABORTS: AtomicUsize = AtomicUsize::new(0);
        let stm = Stm::new();
        assert!(stm.register(Module {
            on_start: Some(Box::new(|| {
                let _ = STARTS.fetch_add(1, SeqCst);
            })),
            on_commit: Some(Box::new(|| {
                let _ = COMMITS.fetch_add(1, SeqCst);
            })),
            on_abort: Some(Box::new(|| {
                let _ = ABORTS.fetch_add(1, SeqCst);
            })),
            ..Module::default()
        }));
        let x = TWord::new(0);
        let mut thread = stm.thread();
        thread.run(Attr::default(), |tx| tx.store(&x, 1));
        assert_eq!(STARTS.load(SeqCst), 1);
        assert_eq!(COMMITS.load(SeqCst), 1);
        let aborted: Result<(), _> = thread.try_run(Attr::default(), |tx| {
            let _ = tx.load(&x)?;
            Err(tx.abort())
        });
        assert!(aborted.is_err());
        assert_eq!(ABORTS.load(SeqCst), 1);
    }

    #[test]
    fn clock_rollover_rewinds_time() {
        let stm = Stm::with_config(Config {
            lock_array_log_size: 8,
            ..Config::default()
        });
        let x = TWord::new(0);
        let mut thread = stm.thread();

        // Age the lock covering x so a stale version exists in the table.
        thread.run(Attr::default(), |tx| tx.store(&x, 1));
        assert_eq!(stm.clock(), 1);

        stm.clock.preload(VERSION_MAX);
        let snapshot = thread.run(Attr::default(), |tx| {
            tx.store(&x, 7)?;
            Ok(tx.snapshot())
        });
        assert_eq!(
            snapshot,
            (0, 0),
            "begin at the end of time must rewind the clock first"
        );
        assert_eq!(stm.clock(), 1, "the rollover commit ticks the fresh clock");
        assert_eq!(x.into_inner(), 7);
    }
}
