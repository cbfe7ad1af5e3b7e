//! The global version clock.
//!
//! Every committed writing transaction bumps the clock exactly once, and the
//! value it obtains becomes the version published to all the lock words it
//! owned. Readers snapshot the clock at begin, giving the `[start, end]`
//! validity interval against which stale versions are detected.
//!
//! The clock lives alone on its cache line; it is the single most contended
//! word in the engine.

use crate::Word;
use core::sync::atomic::{
    AtomicUsize,
    Ordering::{Acquire, Relaxed, SeqCst},
};
use crossbeam_utils::CachePadded;

#[derive(Debug)]
pub struct GlobalClock {
    value: CachePadded<AtomicUsize>,
}

impl GlobalClock {
    #[inline]
    pub fn new() -> Self {
        GlobalClock {
            value: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Current commit timestamp.
    #[inline]
    pub fn now(&self) -> Word {
        self.value.load(Acquire)
    }

    /// Bumps the clock, returning the previous value. Full barrier; this is
    /// the linearization point of a writing commit.
    #[inline]
    pub fn fetch_and_tick(&self) -> Word {
        self.value.fetch_add(1, SeqCst)
    }

    /// Resets the clock to the beginning of time.
    ///
    /// Only sound inside a quiescence barrier, while every lock word is also
    /// being rezeroed and no transaction is in flight.
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Relaxed);
    }

    /// Overwrites the clock. Test-only escape hatch for exercising rollover.
    #[cfg(test)]
    pub fn preload(&self, value: Word) {
        self.value.store(value, SeqCst);
    }
}
