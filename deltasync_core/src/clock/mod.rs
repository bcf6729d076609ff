//! Logical clocks.
//!
//! Every data type instance owns one clock. The clock's uuid binds deltas to
//! the instance, and its timestamps establish the causal order all merge
//! decisions are based on.

use crate::codec::{self, ByteReader, CodecError, Packable};
use crate::errors::{InvalidValueSnafu, Result};
use crate::value::{Inject, Value};
use smallvec::SmallVec;
use snafu::prelude::*;
use std::{cmp, fmt};

mod lamport;
mod vector;

pub use lamport::LamportClock;
pub use vector::{VectorClock, VectorStamp};

/// The causal relation between two timestamps.
///
/// This is a form of partial order: like [[PartialOrd]], but with an explicit
/// variant for timestamps that are incomparable because neither happened
/// before the other.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CausalOrdering {
    /// `a` happened strictly before `b`.
    Before,
    /// `a == b`.
    Equal,
    /// `a` happened strictly after `b`.
    After,
    /// Neither happened before the other.
    Concurrent,
}
impl CausalOrdering {
    /// Reverses the ordering.
    ///
    /// - `Before` becomes `After`.
    /// - `After` becomes `Before`.
    /// - Everything else stays the same.
    pub const fn reverse(self) -> CausalOrdering {
        match self {
            CausalOrdering::Before => CausalOrdering::After,
            CausalOrdering::After => CausalOrdering::Before,
            _ => self,
        }
    }

    /// The conventional `{-1, 0, 1}` form, `None` for concurrent stamps.
    pub const fn sign(self) -> Option<i8> {
        match self {
            CausalOrdering::Before => Some(-1),
            CausalOrdering::Equal => Some(0),
            CausalOrdering::After => Some(1),
            CausalOrdering::Concurrent => None,
        }
    }
}

impl From<cmp::Ordering> for CausalOrdering {
    fn from(value: cmp::Ordering) -> Self {
        match value {
            cmp::Ordering::Less => CausalOrdering::Before,
            cmp::Ordering::Equal => CausalOrdering::Equal,
            cmp::Ordering::Greater => CausalOrdering::After,
        }
    }
}

impl From<CausalOrdering> for Option<cmp::Ordering> {
    fn from(val: CausalOrdering) -> Self {
        match val {
            CausalOrdering::Before => Some(cmp::Ordering::Less),
            CausalOrdering::Equal => Some(cmp::Ordering::Equal),
            CausalOrdering::After => Some(cmp::Ordering::Greater),
            CausalOrdering::Concurrent => None,
        }
    }
}

/// This is somewhat equivalent to a Set<Ordering> just much more compact.
pub(crate) struct OrderingAccumulator {
    seen_equal: bool,
    seen_less: bool,
    seen_greater: bool,
}
impl OrderingAccumulator {
    pub(crate) const fn none() -> Self {
        Self {
            seen_equal: false,
            seen_less: false,
            seen_greater: false,
        }
    }

    pub(crate) fn observe(&mut self, ord: cmp::Ordering) {
        match ord {
            cmp::Ordering::Less => {
                self.seen_less = true;
            }
            cmp::Ordering::Equal => {
                self.seen_equal = true;
            }
            cmp::Ordering::Greater => {
                self.seen_greater = true;
            }
        }
    }

    /// `true` once the result can only be `Concurrent`; callers stop early.
    pub(crate) const fn is_mixed(&self) -> bool {
        self.seen_less && self.seen_greater
    }

    pub(crate) fn finish(&self) -> CausalOrdering {
        debug_assert!(self.seen_equal || self.seen_less || self.seen_greater);
        if self.is_mixed() {
            CausalOrdering::Concurrent
        } else if self.seen_less {
            CausalOrdering::Before
        } else if self.seen_greater {
            CausalOrdering::After
        } else {
            CausalOrdering::Equal
        }
    }
}

/// The clock contract.
///
/// `Timestamp` carries two orders:
/// - the *causal* order, exposed through [[Clock::compare]] and possibly
///   partial, and
/// - the `Ord` *storage* order, which must be a linear extension of the
///   causal one (`compare(a, b) == After` implies `a > b`). It keys internal
///   maps and breaks joins between concurrent stamps deterministically.
pub trait Clock: Clone + fmt::Debug + PartialEq + Packable {
    type Timestamp: Clone + Eq + Ord + fmt::Debug + Packable;

    /// The identity shared by all replicas of one data type instance.
    fn uuid(&self) -> &ClockUuid;

    /// The current timestamp. Never decreases on a given replica.
    fn read(&self) -> Self::Timestamp;

    /// Merge a foreign timestamp and return a fresh local one, strictly
    /// later than both `other` and the pre-call [[Clock::read]].
    fn update(&mut self, other: &Self::Timestamp) -> Self::Timestamp;

    /// Merge a foreign timestamp without producing a local event.
    ///
    /// Afterwards [[Clock::read]] is at least `other`. Unlike
    /// [[Clock::update]] this is order-independent over a set of stamps,
    /// which keeps replica state canonical under delta replay.
    fn absorb(&mut self, other: &Self::Timestamp);

    /// The causal relation of `a` to `b`.
    fn compare(a: &Self::Timestamp, b: &Self::Timestamp) -> CausalOrdering;

    /// The bottom timestamp, used for "never updated" comparisons.
    fn default_ts() -> Self::Timestamp;

    /// A [[Value]] form of `ts` for storage inside replicated payloads.
    fn wrap_ts(ts: &Self::Timestamp) -> Value;

    /// Whether `a` happened strictly after `b`.
    fn is_later(a: &Self::Timestamp, b: &Self::Timestamp) -> bool {
        Self::compare(a, b) == CausalOrdering::After
    }

    /// Whether neither of `a` and `b` happened before the other.
    fn are_concurrent(a: &Self::Timestamp, b: &Self::Timestamp) -> bool {
        Self::compare(a, b) == CausalOrdering::Concurrent
    }

    /// A fresh timestamp for a local event.
    fn tick(&mut self) -> Self::Timestamp {
        let current = self.read();
        self.update(&current)
    }
}

/// The opaque identity of a replicated data type instance.
///
/// All replicas of one instance share the same uuid; deltas carry it and are
/// rejected by instances with a different one.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockUuid(SmallVec<[u8; 16]>);
impl ClockUuid {
    /// A fresh random identity.
    pub fn generate() -> Self {
        Self(SmallVec::from_slice(uuid::Uuid::new_v4().as_bytes()))
    }

    /// Adopt an existing identity. Must be non-empty.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            !bytes.is_empty(),
            InvalidValueSnafu {
                what: "clock uuid",
                reason: "must not be empty".to_string(),
            }
        );
        Ok(Self(SmallVec::from_slice(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
impl fmt::Debug for ClockUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClockUuid({self})")
    }
}
impl fmt::Display for ClockUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}
impl Packable for ClockUuid {
    fn pack_into(&self, out: &mut Vec<u8>) {
        codec::put_byte_seq(out, &self.0);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, _inject: &Inject) -> Result<Self, CodecError> {
        let bytes = reader.byte_seq()?;
        ensure!(
            !bytes.is_empty(),
            codec::InconsistentSnafu {
                reason: "clock uuid must not be empty".to_string(),
            }
        );
        Ok(Self(SmallVec::from_slice(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_ordering_conversions() {
        assert_eq!(CausalOrdering::from(cmp::Ordering::Less), CausalOrdering::Before);
        assert_eq!(CausalOrdering::Before.reverse(), CausalOrdering::After);
        assert_eq!(CausalOrdering::Concurrent.reverse(), CausalOrdering::Concurrent);
        assert_eq!(CausalOrdering::Before.sign(), Some(-1));
        assert_eq!(CausalOrdering::Concurrent.sign(), None);
        let as_ord: Option<cmp::Ordering> = CausalOrdering::Concurrent.into();
        assert_eq!(as_ord, None);
    }

    #[test]
    fn clock_uuid_invariants() {
        let a = ClockUuid::generate();
        let b = ClockUuid::generate();
        assert_ne!(a, b);

        let adopted = ClockUuid::from_bytes(a.as_bytes()).unwrap();
        assert_eq!(a, adopted);

        assert!(ClockUuid::from_bytes(&[]).is_err());

        let packed = a.pack();
        let back = ClockUuid::unpack(&packed, &Inject::EMPTY).unwrap();
        assert_eq!(a, back);
    }
}
