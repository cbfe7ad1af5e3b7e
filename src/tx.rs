//! Types shared by everything transactional: attributes, abort reasons,
//! transaction status, and the engine parameter readout.

use crate::Word;
use core::{
    fmt::{self, Debug, Formatter},
    ops::BitOr,
};

/// Caller-supplied transaction attributes, fixed for the duration of one
/// transaction (including all of its retries).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Attr {
    /// Application-chosen transaction identifier; the engine only stores it.
    pub id: u16,

    /// The transaction promises not to write. Reads skip the read log, which
    /// makes the snapshot unextendable: any stale version aborts with
    /// [`Reason::VAL_READ`].
    pub read_only: bool,

    /// On abort, return control with [`Status::Aborted`] instead of
    /// re-preparing for a retry.
    pub no_retry: bool,

    /// Accepted for compatibility; invisible reads are the only
    /// implemented read design and this field is ignored.
    pub visible_reads: bool,
}

/// A bitfield describing why a transaction rolled back.
///
/// Reasons compose with `|`; the value delivered to the retry path also
/// carries [`Reason::PATH_INSTRUMENTED`].
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Reason(Word);

impl Reason {
    /// Resumed on the instrumented retry path.
    pub const PATH_INSTRUMENTED: Reason = Reason(1);
    /// A load hit a lock owned by another transaction.
    pub const RW_CONFLICT: Reason = Reason(1 << 1);
    /// A store hit a lock owned by another transaction.
    pub const WW_CONFLICT: Reason = Reason(1 << 2);
    /// A load observed a version newer than the snapshot and the snapshot
    /// could not be extended.
    pub const VAL_READ: Reason = Reason(1 << 3);
    /// A store would overwrite a stripe read at an older version.
    pub const VAL_WRITE: Reason = Reason(1 << 4);
    /// Commit-time read validation failed.
    pub const VALIDATE: Reason = Reason(1 << 5);
    /// The write log was full; its capacity has been doubled for the retry.
    pub const EXTEND_WS: Reason = Reason(1 << 6);
    /// Reserved for irrevocability conflicts; never produced here.
    pub const IRREVOCABLE: Reason = Reason(1 << 7);
    /// The application requested the abort.
    pub const EXPLICIT: Reason = Reason(1 << 8);
    /// Suppresses the retry: control returns with the transaction aborted.
    pub const NO_RETRY: Reason = Reason(1 << 9);

    /// Returns true if every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: Reason) -> bool {
        self.0 & other.0 == other.0
    }

    /// The raw bit pattern.
    #[inline]
    pub fn bits(self) -> Word {
        self.0
    }
}

impl BitOr for Reason {
    type Output = Reason;

    #[inline]
    fn bitor(self, rhs: Reason) -> Reason {
        Reason(self.0 | rhs.0)
    }
}

impl Debug for Reason {
    #[cold]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        const NAMES: &[(Reason, &str)] = &[
            (Reason::RW_CONFLICT, "RW_CONFLICT"),
            (Reason::WW_CONFLICT, "WW_CONFLICT"),
            (Reason::VAL_READ, "VAL_READ"),
            (Reason::VAL_WRITE, "VAL_WRITE"),
            (Reason::VALIDATE, "VALIDATE"),
            (Reason::EXTEND_WS, "EXTEND_WS"),
            (Reason::IRREVOCABLE, "IRREVOCABLE"),
            (Reason::EXPLICIT, "EXPLICIT"),
            (Reason::NO_RETRY, "NO_RETRY"),
            (Reason::PATH_INSTRUMENTED, "PATH_INSTRUMENTED"),
        ];
        let mut list = formatter.debug_set();
        for (reason, name) in NAMES {
            if self.contains(*reason) {
                let _ = list.entry(name);
            }
        }
        list.finish()
    }
}

/// An error value indicating that the current transaction has rolled back.
///
/// `Abort` values are only produced by the engine (or by
/// [`Tx::abort`](crate::thread::Tx::abort)); route them back to
/// [`ThreadTx::run`](crate::thread::ThreadTx::run) with `?`, where the
/// transaction body is re-entered. By the time an `Abort` is observable,
/// every lock the transaction held has already been released.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Abort {
    reason: Reason,
}

impl Debug for Abort {
    #[cold]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Abort")
            .field("reason", &self.reason)
            .finish()
    }
}

impl Abort {
    #[inline]
    pub(crate) fn new(reason: Reason) -> Self {
        Abort { reason }
    }

    /// The reason bits the rollback was performed with.
    #[inline]
    pub fn reason(&self) -> Reason {
        self.reason
    }
}

/// Transaction status. The lowest bit of the encoding marks a transaction
/// in flight; quiescence relies on that bit alone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Status {
    Idle = 0,
    Active = 1,
    Committed = 2,
    Committing = 3,
    Aborted = 4,
    Aborting = 5,
    Killed = 7,
    Irrevocable = 9,
}

impl Status {
    #[inline]
    pub fn is_active(self) -> bool {
        self.as_word() & 1 == 1
    }

    #[inline]
    pub(crate) fn as_word(self) -> Word {
        self as Word
    }

    #[inline]
    pub(crate) fn from_word(word: Word) -> Status {
        match word {
            0 => Status::Idle,
            1 => Status::Active,
            2 => Status::Committed,
            3 => Status::Committing,
            4 => Status::Aborted,
            5 => Status::Aborting,
            7 => Status::Killed,
            9 => Status::Irrevocable,
            _ => unreachable!("corrupt status word"),
        }
    }
}

/// A value returned by [`Stm::get_parameter`](crate::stm::Stm::get_parameter).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Parameter {
    Str(&'static str),
    Usize(usize),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reasons_compose() {
        let r = Reason::VAL_READ | Reason::PATH_INSTRUMENTED;
        assert!(r.contains(Reason::VAL_READ));
        assert!(r.contains(Reason::PATH_INSTRUMENTED));
        assert!(!r.contains(Reason::EXPLICIT));
    }

    #[test]
    fn status_active_bit() {
        assert!(Status::Active.is_active());
        assert!(Status::Committing.is_active());
        assert!(Status::Aborting.is_active());
        assert!(Status::Killed.is_active());
        assert!(Status::Irrevocable.is_active());
        assert!(!Status::Idle.is_active());
        assert!(!Status::Committed.is_active());
        assert!(!Status::Aborted.is_active());
    }

    #[test]
    fn status_round_trips() {
        for &s in &[
            Status::Idle,
            Status::Active,
            Status::Committed,
            Status::Committing,
            Status::Aborted,
            Status::Aborting,
            Status::Killed,
            Status::Irrevocable,
        ] {
            assert_eq!(Status::from_word(s.as_word()), s);
        }
    }
}
