//! The shared surface of every replicated data type.

use crate::clock::{CausalOrdering, Clock, ClockUuid};
use crate::codec::Packable;
use crate::errors::{ClockMismatchSnafu, CodecSnafu, Result};
use crate::history::{Checksums, Digest, MerkleHistory, checksums_over};
use crate::listeners::{ListenerId, ListenerResult, Listeners};
use crate::update::StateUpdate;
use crate::value::Inject;
use snafu::prelude::*;
use std::fmt;

/// The timestamp type of a data type's clock.
pub type TimestampOf<T> = <<T as DeltaCrdt>::Clock as Clock>::Timestamp;

/// Whether `ts` falls into the (optionally half-open) causal range.
///
/// Stamps concurrent with a bound are included; only stamps strictly before
/// `from` or strictly after `until` are filtered.
pub fn timestamp_in_range<C: Clock>(
    ts: &C::Timestamp,
    from: Option<&C::Timestamp>,
    until: Option<&C::Timestamp>,
) -> bool {
    if let Some(from) = from {
        if C::compare(ts, from) == CausalOrdering::Before {
            return false;
        }
    }
    if let Some(until) = until {
        if C::compare(ts, until) == CausalOrdering::After {
            return false;
        }
    }
    true
}

/// A delta-state replicated data type.
///
/// Implementations own their clock and enough applied-delta storage to
/// replay their observable state. `update` must be idempotent and
/// commutative over deltas sharing the instance's clock uuid, and must
/// apply atomically: validation and listener dispatch happen before the
/// first mutation.
pub trait DeltaCrdt: Packable {
    type Clock: Clock;
    type Payload: Clone + fmt::Debug + PartialEq + Packable;
    type View;

    fn clock(&self) -> &Self::Clock;

    /// The observable state. A pure function of the applied delta set.
    fn read(&self) -> Self::View;

    /// Apply one delta. Returns `self` for chaining.
    fn update(
        &mut self,
        delta: &StateUpdate<Self::Payload, TimestampOf<Self>>,
    ) -> Result<&mut Self>;

    /// A minimal delta set whose replay on an empty instance with the same
    /// clock uuid reproduces the observable state of the range.
    fn history(
        &self,
        from: Option<&TimestampOf<Self>>,
        until: Option<&TimestampOf<Self>>,
    ) -> Vec<StateUpdate<Self::Payload, TimestampOf<Self>>>;

    fn listeners(&self) -> &Listeners<StateUpdate<Self::Payload, TimestampOf<Self>>>;

    fn listeners_mut(&mut self)
    -> &mut Listeners<StateUpdate<Self::Payload, TimestampOf<Self>>>;

    fn clock_uuid(&self) -> &ClockUuid {
        self.clock().uuid()
    }

    /// Reject deltas addressed to a different instance.
    fn ensure_same_clock(
        &self,
        delta: &StateUpdate<Self::Payload, TimestampOf<Self>>,
    ) -> Result<()> {
        ensure!(
            delta.clock_uuid() == self.clock_uuid(),
            ClockMismatchSnafu {
                expected: self.clock_uuid().clone(),
                actual: delta.clock_uuid().clone(),
            }
        );
        Ok(())
    }

    fn add_listener(
        &mut self,
        listener: Box<dyn Fn(&StateUpdate<Self::Payload, TimestampOf<Self>>) -> ListenerResult>,
    ) -> ListenerId {
        self.listeners_mut().add(listener)
    }

    fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners_mut().remove(id)
    }

    fn invoke_listeners(
        &self,
        delta: &StateUpdate<Self::Payload, TimestampOf<Self>>,
    ) -> ListenerResult {
        self.listeners().invoke(delta)
    }

    fn checksums(
        &self,
        from: Option<&TimestampOf<Self>>,
        until: Option<&TimestampOf<Self>>,
    ) -> Checksums {
        checksums_over(self.history(from, until).iter().map(Packable::pack))
    }

    fn get_merkle_history(&self) -> MerkleHistory {
        MerkleHistory::over(self.history(None, None).iter().map(Packable::pack))
    }

    /// The peer leaves this side must request.
    fn resolve_merkle_histories(
        &self,
        peer_root: &Digest,
        peer_leaves: &[Digest],
    ) -> Vec<Digest> {
        self.get_merkle_history()
            .missing_leaves(peer_root, peer_leaves)
    }

    /// Decode and apply a packed delta, e.g. one requested during Merkle
    /// reconciliation.
    fn update_packed(&mut self, bytes: &[u8], inject: &Inject) -> Result<&mut Self> {
        let delta = StateUpdate::unpack(bytes, inject).context(CodecSnafu)?;
        self.update(&delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LamportClock;

    #[test]
    fn range_filter_on_total_order() {
        type C = LamportClock;
        assert!(timestamp_in_range::<C>(&5, None, None));
        assert!(timestamp_in_range::<C>(&5, Some(&5), Some(&5)));
        assert!(timestamp_in_range::<C>(&5, Some(&3), None));
        assert!(!timestamp_in_range::<C>(&2, Some(&3), None));
        assert!(timestamp_in_range::<C>(&5, None, Some(&7)));
        assert!(!timestamp_in_range::<C>(&9, None, Some(&7)));
    }

    #[test]
    fn range_filter_keeps_concurrent_stamps() {
        use crate::clock::{VectorClock, VectorStamp};
        let concurrent_with_bound = VectorStamp::from([0, 5, 0]);
        let bound = VectorStamp::from([3, 0, 0]);
        assert!(timestamp_in_range::<VectorClock>(
            &concurrent_with_bound,
            Some(&bound),
            None
        ));
        assert!(timestamp_in_range::<VectorClock>(
            &concurrent_with_bound,
            None,
            Some(&bound)
        ));
    }
}
