//! The transactional memory primitive [`TWord`]: one machine word.
//!
//! # Examples
//!
//! Creating a `TWord`:
//!
//! ```
//! use wstm::tword::TWord;
//!
//! static ZERO: TWord = TWord::new(0);
//! let x = TWord::new(42);
//! ```
//!
//! Reading and writing inside a transaction:
//!
//! ```
//! use wstm::{stm, tword::TWord};
//!
//! let x = TWord::new(1);
//! let mut thread = stm::global().thread();
//! let doubled = thread.run(Default::default(), |tx| {
//!     let v = tx.load(&x)?;
//!     tx.store(&x, v * 2)?;
//!     Ok(v * 2)
//! });
//! assert_eq!(doubled, 2);
//! assert_eq!(x.into_inner(), 2);
//! ```

use crate::Word;
use core::{
    fmt::{self, Debug, Formatter},
    sync::atomic::AtomicUsize,
};

/// A transactional memory location holding one unsigned machine word.
///
/// The word is stored inline; a `TWord` is exactly one word wide and
/// naturally aligned. There is no per-location lock: the engine maps the
/// `TWord`'s address onto a stripe of a shared lock table, so distinct
/// `TWord`s may contend on one lock. That trades false conflicts for a
/// table that stays compact and cache-resident.
///
/// All transactional access goes through [`Tx::load`], [`Tx::store`] and
/// friends; exclusive access through `&mut self` needs no synchronization
/// at all.
///
/// [`Tx::load`]: crate::thread::Tx::load
/// [`Tx::store`]: crate::thread::Tx::store
#[repr(transparent)]
pub struct TWord {
    value: AtomicUsize,
}

impl Debug for TWord {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("TWord").field("value", &"..").finish()
    }
}

impl Default for TWord {
    #[inline]
    fn default() -> TWord {
        TWord::new(0)
    }
}

impl From<Word> for TWord {
    #[inline]
    fn from(value: Word) -> TWord {
        TWord::new(value)
    }
}

impl TWord {
    /// Constructs a new `TWord` from an initial value.
    ///
    /// Performs no allocation or synchronization.
    ///
    /// # Examples
    ///
    /// ```
    /// use wstm::tword::TWord;
    ///
    /// static ZERO: TWord = TWord::new(0);
    /// ```
    #[inline]
    pub const fn new(value: Word) -> TWord {
        TWord {
            value: AtomicUsize::new(value),
        }
    }

    /// Consumes the `TWord`, returning the contained word.
    ///
    /// # Examples
    ///
    /// ```
    /// use wstm::tword::TWord;
    ///
    /// let x = TWord::new(42);
    /// assert_eq!(x.into_inner(), 42);
    /// ```
    #[inline]
    pub fn into_inner(self) -> Word {
        self.value.into_inner()
    }

    /// Returns a mutable reference to the contained word.
    ///
    /// The mutable borrow statically guarantees no transaction is accessing
    /// this location, so no synchronization takes place.
    ///
    /// # Examples
    ///
    /// ```
    /// use wstm::tword::TWord;
    ///
    /// let mut x = TWord::new(0);
    /// *x.get_mut() = 7;
    /// assert_eq!(x.into_inner(), 7);
    /// ```
    #[inline]
    pub fn get_mut(&mut self) -> &mut Word {
        self.value.get_mut()
    }

    /// The location the engine hashes and loads/stores. Address identity is
    /// what maps this `TWord` onto its lock stripe.
    #[inline]
    pub(crate) fn word(&self) -> *const AtomicUsize {
        &self.value
    }
}
