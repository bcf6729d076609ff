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
use std::collections::BTreeSet;

/// Payload of one positive-negative counter step.
///
/// Exactly one of the two components is non-zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PnCounterDelta {
    pub positive: u64,
    pub negative: u64,
}
impl PnCounterDelta {
    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(
            (self.positive >= 1) != (self.negative >= 1),
            InvalidValueSnafu {
                what: "pn-counter amounts",
                reason: "exactly one of positive and negative must be at least 1".to_string(),
            }
        );
        Ok(())
    }
}
impl Packable for PnCounterDelta {
    fn pack_into(&self, out: &mut Vec<u8>) {
        codec::put_u64(out, self.positive);
        codec::put_u64(out, self.negative);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, _inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            positive: reader.u64()?,
            negative: reader.u64()?,
        })
    }
}

/// A counter that can go both ways: a pair of grow-only accumulators.
#[derive(Clone, Debug, PartialEq)]
pub struct PnCounter<C: Clock = LamportClock> {
    clock: C,
    entries: BTreeSet<(C::Timestamp, u64, u64)>,
    listeners: Listeners<StateUpdate<PnCounterDelta, C::Timestamp>>,
}
impl PnCounter<LamportClock> {
    pub fn new() -> Self {
        Self::with_clock(LamportClock::new())
    }
}
impl Default for PnCounter<LamportClock> {
    fn default() -> Self {
        Self::new()
    }
}
impl<C: Clock> PnCounter<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            entries: BTreeSet::new(),
            listeners: Listeners::new(),
        }
    }

    pub fn increase(
        &mut self,
        amount: u64,
    ) -> Result<StateUpdate<PnCounterDelta, C::Timestamp>> {
        self.step(PnCounterDelta {
            positive: amount,
            negative: 0,
        })
    }

    pub fn decrease(
        &mut self,
        amount: u64,
    ) -> Result<StateUpdate<PnCounterDelta, C::Timestamp>> {
        self.step(PnCounterDelta {
            positive: 0,
            negative: amount,
        })
    }

    fn step(
        &mut self,
        data: PnCounterDelta,
    ) -> Result<StateUpdate<PnCounterDelta, C::Timestamp>> {
        data.validate()?;
        let ts = self.clock.tick();
        let delta = StateUpdate::new(self.clock.uuid().clone(), ts, data);
        self.update(&delta)?;
        Ok(delta)
    }
}
impl<C: Clock> DeltaCrdt for PnCounter<C> {
    type Clock = C;
    type Payload = PnCounterDelta;
    type View = i128;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&self) -> i128 {
        self.entries
            .iter()
            .map(|(_, positive, negative)| i128::from(*positive) - i128::from(*negative))
            .sum()
    }

    fn update(
        &mut self,
        delta: &StateUpdate<PnCounterDelta, C::Timestamp>,
    ) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        delta.data().validate()?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());
        self.entries.insert((
            delta.ts().clone(),
            delta.data().positive,
            delta.data().negative,
        ));
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<PnCounterDelta, C::Timestamp>> {
        self.entries
            .iter()
            .filter(|(ts, _, _)| timestamp_in_range::<C>(ts, from, until))
            .map(|(ts, positive, negative)| {
                StateUpdate::new(
                    self.clock.uuid().clone(),
                    ts.clone(),
                    PnCounterDelta {
                        positive: *positive,
                        negative: *negative,
                    },
                )
            })
            .collect()
    }

    fn listeners(&self) -> &Listeners<StateUpdate<PnCounterDelta, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(
        &mut self,
    ) -> &mut Listeners<StateUpdate<PnCounterDelta, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> Packable for PnCounter<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        codec::put_len(out, self.entries.len());
        for (ts, positive, negative) in &self.entries {
            ts.pack_into(out);
            codec::put_u64(out, *positive);
            codec::put_u64(out, *negative);
        }
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let count = reader.u32()? as usize;
        let mut entries = BTreeSet::new();
        for _ in 0..count {
            let ts = C::Timestamp::unpack_from(reader, inject)?;
            let positive = reader.u64()?;
            let negative = reader.u64()?;
            entries.insert((ts, positive, negative));
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
    use deltasync_core::{ClockUuid, CrdtError, VectorClock};
    use itertools::Itertools;
    use std::num::NonZeroUsize;

    fn replica_of(counter: &PnCounter) -> PnCounter {
        PnCounter::with_clock(LamportClock::with_uuid(counter.clock_uuid().clone()))
    }

    #[test]
    fn mixed_steps_accumulate() {
        let mut counter = PnCounter::new();
        counter.increase(5).unwrap();
        counter.decrease(2).unwrap();
        counter.decrease(7).unwrap();
        assert_eq!(counter.read(), -4);
    }

    #[test]
    fn both_or_neither_component_is_rejected() {
        let mut counter = PnCounter::new();
        let delta = StateUpdate::new(
            counter.clock_uuid().clone(),
            1,
            PnCounterDelta {
                positive: 1,
                negative: 1,
            },
        );
        assert!(matches!(
            counter.update(&delta).unwrap_err(),
            CrdtError::InvalidValue { .. }
        ));

        let delta = StateUpdate::new(
            counter.clock_uuid().clone(),
            1,
            PnCounterDelta {
                positive: 0,
                negative: 0,
            },
        );
        assert!(matches!(
            counter.update(&delta).unwrap_err(),
            CrdtError::InvalidValue { .. }
        ));
        assert_eq!(counter.read(), 0);
    }

    #[test]
    fn deltas_commute_and_are_idempotent() {
        let mut source = PnCounter::new();
        let deltas = vec![
            source.increase(10).unwrap(),
            source.decrease(4).unwrap(),
            source.increase(1).unwrap(),
        ];

        let mut previous: Option<PnCounter> = None;
        for perm in deltas.iter().permutations(deltas.len()) {
            let mut replica = replica_of(&source);
            for delta in perm {
                replica.update(delta).unwrap();
                replica.update(delta).unwrap();
            }
            assert_eq!(replica.read(), 7);
            if let Some(ref previous) = previous {
                assert_eq!(previous.pack(), replica.pack());
            }
            previous = Some(replica);
        }
    }

    #[test]
    fn history_replay_matches_reads_and_checksums() {
        let mut counter = PnCounter::new();
        counter.increase(3).unwrap();
        counter.decrease(1).unwrap();

        let mut replica = replica_of(&counter);
        for delta in counter.history(None, None) {
            replica.update(&delta).unwrap();
        }
        assert_eq!(replica.read(), counter.read());
        assert_eq!(replica.checksums(None, None), counter.checksums(None, None));
    }

    #[test]
    fn pack_roundtrip() {
        let mut counter = PnCounter::new();
        counter.increase(3).unwrap();
        counter.decrease(8).unwrap();

        let back = PnCounter::unpack(&counter.pack(), &Inject::EMPTY).unwrap();
        assert_eq!(back, counter);
        assert_eq!(back.read(), -5);
    }

    #[test]
    fn concurrent_vector_stamp_steps_converge() {
        let uuid = ClockUuid::generate();
        let members = NonZeroUsize::new(2).unwrap();
        let mut a = PnCounter::with_clock(VectorClock::new(uuid.clone(), members, 0));
        let mut b = PnCounter::with_clock(VectorClock::new(uuid, members, 1));

        let from_a = a.increase(5).unwrap();
        let from_b = b.decrease(2).unwrap();
        assert!(VectorClock::are_concurrent(from_a.ts(), from_b.ts()));

        a.update(&from_b).unwrap();
        b.update(&from_a).unwrap();
        assert_eq!(a.read(), 3);
        assert_eq!(b.read(), 3);
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn merkle_sync_converges() {
        let uuid = ClockUuid::generate();
        let mut a = PnCounter::with_clock(LamportClock::with_uuid(uuid.clone()));
        let mut b = PnCounter::with_clock(LamportClock::with_uuid(uuid));

        a.increase(6).unwrap();
        b.decrease(2).unwrap();

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

        assert_eq!(a.read(), 4);
        assert_eq!(b.read(), 4);
        assert_eq!(a.get_merkle_history().root(), b.get_merkle_history().root());
    }
}
