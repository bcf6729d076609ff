use deltasync_core::{
    Clock,
    DeltaCrdt,
    LamportClock,
    Listeners,
    Packable,
    Result,
    StateUpdate,
    codec::{self, ByteReader, CodecError},
    errors::{InvalidValueSnafu, ListenerRejectedSnafu},
    timestamp_in_range,
    value::Inject,
};
use snafu::prelude::*;

/// Payload of one counter increment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterDelta {
    pub amount: u64,
}
impl Packable for CounterDelta {
    fn pack_into(&self, out: &mut Vec<u8>) {
        codec::put_u64(out, self.amount);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, _inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            amount: reader.u64()?,
        })
    }
}

/// A grow-only counter.
///
/// The observable value is the sum over all distinct `(timestamp, amount)`
/// pairs ever applied, which makes re-delivered deltas free. Replicas that
/// each need their own additive contribution without stamp collisions should
/// use [[crate::CounterSet]] instead.
#[derive(Clone, Debug, PartialEq)]
pub struct Counter<C: Clock = LamportClock> {
    clock: C,
    entries: std::collections::BTreeSet<(C::Timestamp, u64)>,
    listeners: Listeners<StateUpdate<CounterDelta, C::Timestamp>>,
}
impl Counter<LamportClock> {
    /// A fresh instance with a generated clock uuid.
    pub fn new() -> Self {
        Self::with_clock(LamportClock::new())
    }
}
impl Default for Counter<LamportClock> {
    fn default() -> Self {
        Self::new()
    }
}
impl<C: Clock> Counter<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            entries: std::collections::BTreeSet::new(),
            listeners: Listeners::new(),
        }
    }

    /// Add `amount` (at least 1) and return the update for propagation.
    pub fn increase(
        &mut self,
        amount: u64,
    ) -> Result<StateUpdate<CounterDelta, C::Timestamp>> {
        ensure!(
            amount >= 1,
            InvalidValueSnafu {
                what: "counter amount",
                reason: "must be at least 1".to_string(),
            }
        );
        let ts = self.clock.tick();
        let delta = StateUpdate::new(self.clock.uuid().clone(), ts, CounterDelta { amount });
        self.update(&delta)?;
        Ok(delta)
    }

    fn validate(delta: &StateUpdate<CounterDelta, C::Timestamp>) -> Result<()> {
        ensure!(
            delta.data().amount >= 1,
            InvalidValueSnafu {
                what: "counter amount",
                reason: "must be at least 1".to_string(),
            }
        );
        Ok(())
    }
}
impl<C: Clock> DeltaCrdt for Counter<C> {
    type Clock = C;
    type Payload = CounterDelta;
    type View = u64;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&self) -> u64 {
        self.entries.iter().map(|(_, amount)| *amount).sum()
    }

    fn update(
        &mut self,
        delta: &StateUpdate<CounterDelta, C::Timestamp>,
    ) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        Self::validate(delta)?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());
        self.entries.insert((delta.ts().clone(), delta.data().amount));
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<CounterDelta, C::Timestamp>> {
        self.entries
            .iter()
            .filter(|(ts, _)| timestamp_in_range::<C>(ts, from, until))
            .map(|(ts, amount)| {
                StateUpdate::new(
                    self.clock.uuid().clone(),
                    ts.clone(),
                    CounterDelta { amount: *amount },
                )
            })
            .collect()
    }

    fn listeners(&self) -> &Listeners<StateUpdate<CounterDelta, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(&mut self) -> &mut Listeners<StateUpdate<CounterDelta, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> Packable for Counter<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        codec::put_len(out, self.entries.len());
        for (ts, amount) in &self.entries {
            ts.pack_into(out);
            codec::put_u64(out, *amount);
        }
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let count = reader.u32()? as usize;
        let mut entries = std::collections::BTreeSet::new();
        for _ in 0..count {
            let ts = C::Timestamp::unpack_from(reader, inject)?;
            let amount = reader.u64()?;
            entries.insert((ts, amount));
        }
        Ok(Self {
            clock,
            entries,
            listeners: Listeners::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltasync_core::{ClockUuid, CrdtError, ListenerError, VectorClock};
    use itertools::Itertools;
    use proptest::prelude::*;
    use std::num::NonZeroUsize;

    fn replica_of(counter: &Counter) -> Counter {
        Counter::with_clock(LamportClock::with_uuid(counter.clock_uuid().clone()))
    }

    #[test]
    fn local_increase_accumulates() {
        let mut counter = Counter::new();
        counter.increase(1).unwrap();
        counter.increase(4).unwrap();
        assert_eq!(counter.read(), 5);
    }

    #[test]
    fn zero_amount_is_rejected() {
        let mut counter = Counter::new();
        let err = counter.increase(0).unwrap_err();
        assert!(matches!(err, CrdtError::InvalidValue { .. }));
        assert_eq!(counter.read(), 0);
    }

    #[test]
    fn history_replay_converges() {
        let mut c1 = Counter::new();
        c1.increase(1).unwrap();
        c1.increase(1).unwrap();

        let mut c2 = replica_of(&c1);
        for delta in c1.history(None, None) {
            c2.update(&delta).unwrap();
        }
        assert_eq!(c2.read(), 2);
        assert_eq!(c2.checksums(None, None), c1.checksums(None, None));
    }

    #[test]
    fn duplicate_deltas_are_no_ops() {
        let mut c1 = Counter::new();
        let delta = c1.increase(3).unwrap();

        let mut c2 = replica_of(&c1);
        c2.update(&delta).unwrap();
        c2.update(&delta).unwrap();
        assert_eq!(c2.read(), 3);
    }

    #[test]
    fn deltas_commute() {
        let mut source = Counter::new();
        let deltas = vec![
            source.increase(1).unwrap(),
            source.increase(2).unwrap(),
            source.increase(3).unwrap(),
        ];

        let mut previous: Option<Counter> = None;
        for perm in deltas.iter().permutations(deltas.len()) {
            let mut replica = replica_of(&source);
            for delta in perm {
                replica.update(delta).unwrap();
            }
            assert_eq!(replica.read(), 6);
            if let Some(ref previous) = previous {
                assert_eq!(previous.read(), replica.read());
                assert_eq!(previous.pack(), replica.pack());
            }
            previous = Some(replica);
        }
    }

    #[test]
    fn foreign_deltas_are_rejected() {
        let mut c1 = Counter::new();
        let mut other = Counter::new();
        let foreign = other.increase(1).unwrap();

        let err = c1.update(&foreign).unwrap_err();
        assert!(matches!(err, CrdtError::ClockMismatch { .. }));
        assert_eq!(c1.read(), 0);
    }

    #[test]
    fn rejecting_listener_blocks_the_apply() {
        let mut counter = Counter::new();
        counter.add_listener(Box::new(|_| Err(ListenerError::new("vetoed"))));
        let err = counter.increase(1).unwrap_err();
        assert!(matches!(err, CrdtError::ListenerRejected { .. }));
        assert_eq!(counter.read(), 0);
    }

    #[test]
    fn pack_roundtrip() {
        let mut counter = Counter::new();
        counter.increase(2).unwrap();
        counter.increase(7).unwrap();

        let back = Counter::unpack(&counter.pack(), &Inject::EMPTY).unwrap();
        assert_eq!(back, counter);
        assert_eq!(back.read(), 9);
        assert_eq!(back.pack(), counter.pack());
    }

    #[test]
    fn range_filtered_history() {
        let mut counter = Counter::new();
        counter.increase(1).unwrap(); // ts 1
        counter.increase(2).unwrap(); // ts 3
        counter.increase(3).unwrap(); // ts 5

        let full = counter.history(None, None);
        assert_eq!(full.len(), 3);

        let late = counter.history(Some(&2), None);
        assert_eq!(late.len(), 2);
        let early = counter.history(None, Some(&2));
        assert_eq!(early.len(), 1);
    }

    proptest! {
        #[test]
        fn forward_and_reverse_replay_agree(
            amounts in prop::collection::vec(1u64..100, 1..8)
        ) {
            let mut source = Counter::new();
            let deltas: Vec<_> = amounts
                .iter()
                .map(|amount| source.increase(*amount).unwrap())
                .collect();

            let mut forward = replica_of(&source);
            for delta in &deltas {
                forward.update(delta).unwrap();
            }
            let mut reverse = replica_of(&source);
            for delta in deltas.iter().rev() {
                reverse.update(delta).unwrap();
            }

            prop_assert_eq!(forward.pack(), reverse.pack());
            prop_assert_eq!(forward.read(), amounts.iter().sum::<u64>());
        }
    }

    #[test]
    fn concurrent_vector_stamp_increases_converge() {
        let uuid = ClockUuid::generate();
        let members = NonZeroUsize::new(2).unwrap();
        let mut a = Counter::with_clock(VectorClock::new(uuid.clone(), members, 0));
        let mut b = Counter::with_clock(VectorClock::new(uuid, members, 1));

        let from_a = a.increase(1).unwrap();
        let from_b = b.increase(2).unwrap();
        assert!(VectorClock::are_concurrent(from_a.ts(), from_b.ts()));

        a.update(&from_b).unwrap();
        b.update(&from_a).unwrap();
        assert_eq!(a.read(), 3);
        assert_eq!(b.read(), 3);
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn merkle_sync_between_replicas() {
        let uuid = ClockUuid::generate();
        let mut a = Counter::with_clock(LamportClock::with_uuid(uuid.clone()));
        let mut b = Counter::with_clock(LamportClock::with_uuid(uuid));

        let shared = a.increase(1).unwrap();
        b.update(&shared).unwrap();
        a.increase(2).unwrap();
        b.increase(4).unwrap();

        let a_history = a.get_merkle_history();
        let b_history = b.get_merkle_history();

        for leaf in a.resolve_merkle_histories(b_history.root(), b_history.leaves()) {
            a.update_packed(b_history.delta(&leaf).unwrap(), &Inject::EMPTY)
                .unwrap();
        }
        for leaf in b.resolve_merkle_histories(a_history.root(), a_history.leaves()) {
            b.update_packed(a_history.delta(&leaf).unwrap(), &Inject::EMPTY)
                .unwrap();
        }

        assert_eq!(a.read(), 7);
        assert_eq!(b.read(), 7);
        assert_eq!(
            a.get_merkle_history().root(),
            b.get_merkle_history().root()
        );
    }
}
