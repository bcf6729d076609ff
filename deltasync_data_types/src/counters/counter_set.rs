use super::PnCounterDelta;
use deltasync_core::{
    Clock,
    DeltaCrdt,
    LamportClock,
    Listeners,
    Packable,
    Result,
    StateUpdate,
    Value,
    codec::{self, ByteReader, CodecError},
    errors::ListenerRejectedSnafu,
    timestamp_in_range,
    value::Inject,
};
use snafu::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Payload addressing one member counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterSetDelta {
    pub counter_id: Value,
    pub step: PnCounterDelta,
}
impl Packable for CounterSetDelta {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.counter_id.pack_into(out);
        self.step.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            counter_id: Value::unpack_from(reader, inject)?,
            step: PnCounterDelta::unpack_from(reader, inject)?,
        })
    }
}

/// A grow-only set of member counters, read as their sum.
///
/// Each writer contributes through its own `counter_id`, so concurrent
/// steps from distinct replicas can never collide on a `(timestamp, amount)`
/// pair the way they could on a single shared [[super::Counter]].
#[derive(Clone, Debug, PartialEq)]
pub struct CounterSet<C: Clock = LamportClock> {
    clock: C,
    /// First-observation stamp per member id.
    ids: BTreeMap<Value, C::Timestamp>,
    entries: BTreeMap<Value, BTreeSet<(C::Timestamp, u64, u64)>>,
    listeners: Listeners<StateUpdate<CounterSetDelta, C::Timestamp>>,
}
impl CounterSet<LamportClock> {
    pub fn new() -> Self {
        Self::with_clock(LamportClock::new())
    }
}
impl Default for CounterSet<LamportClock> {
    fn default() -> Self {
        Self::new()
    }
}
impl<C: Clock> CounterSet<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            ids: BTreeMap::new(),
            entries: BTreeMap::new(),
            listeners: Listeners::new(),
        }
    }

    /// Member ids observed so far, in value order.
    pub fn counter_ids(&self) -> Vec<Value> {
        self.ids.keys().cloned().collect()
    }

    /// The member counter values, in id order.
    pub fn read_counters(&self) -> BTreeMap<Value, i128> {
        self.entries
            .iter()
            .map(|(id, entries)| {
                let sum = entries
                    .iter()
                    .map(|(_, positive, negative)| i128::from(*positive) - i128::from(*negative))
                    .sum();
                (id.clone(), sum)
            })
            .collect()
    }

    pub fn increase(
        &mut self,
        counter_id: Value,
        amount: u64,
    ) -> Result<StateUpdate<CounterSetDelta, C::Timestamp>> {
        self.step(
            counter_id,
            PnCounterDelta {
                positive: amount,
                negative: 0,
            },
        )
    }

    pub fn decrease(
        &mut self,
        counter_id: Value,
        amount: u64,
    ) -> Result<StateUpdate<CounterSetDelta, C::Timestamp>> {
        self.step(
            counter_id,
            PnCounterDelta {
                positive: 0,
                negative: amount,
            },
        )
    }

    fn step(
        &mut self,
        counter_id: Value,
        step: PnCounterDelta,
    ) -> Result<StateUpdate<CounterSetDelta, C::Timestamp>> {
        step.validate()?;
        let ts = self.clock.tick();
        let delta = StateUpdate::new(
            self.clock.uuid().clone(),
            ts,
            CounterSetDelta { counter_id, step },
        );
        self.update(&delta)?;
        Ok(delta)
    }
}
impl<C: Clock> DeltaCrdt for CounterSet<C> {
    type Clock = C;
    type Payload = CounterSetDelta;
    type View = i128;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&self) -> i128 {
        self.entries
            .values()
            .flat_map(|entries| entries.iter())
            .map(|(_, positive, negative)| i128::from(*positive) - i128::from(*negative))
            .sum()
    }

    fn update(
        &mut self,
        delta: &StateUpdate<CounterSetDelta, C::Timestamp>,
    ) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        delta.data().step.validate()?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());

        let id = delta.data().counter_id.clone();
        // Lazily install the member counter, keeping the earliest stamp.
        match self.ids.entry(id.clone()) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(delta.ts().clone());
            }
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                if delta.ts() < entry.get() {
                    entry.insert(delta.ts().clone());
                }
            }
        }
        self.entries.entry(id).or_default().insert((
            delta.ts().clone(),
            delta.data().step.positive,
            delta.data().step.negative,
        ));
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<CounterSetDelta, C::Timestamp>> {
        self.entries
            .iter()
            .flat_map(|(id, entries)| {
                entries
                    .iter()
                    .filter(|(ts, _, _)| timestamp_in_range::<C>(ts, from, until))
                    .map(|(ts, positive, negative)| {
                        StateUpdate::new(
                            self.clock.uuid().clone(),
                            ts.clone(),
                            CounterSetDelta {
                                counter_id: id.clone(),
                                step: PnCounterDelta {
                                    positive: *positive,
                                    negative: *negative,
                                },
                            },
                        )
                    })
            })
            .collect()
    }

    fn listeners(&self) -> &Listeners<StateUpdate<CounterSetDelta, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(
        &mut self,
    ) -> &mut Listeners<StateUpdate<CounterSetDelta, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> Packable for CounterSet<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        codec::put_len(out, self.ids.len());
        for (id, first_ts) in &self.ids {
            id.pack_into(out);
            first_ts.pack_into(out);
            let entries = self.entries.get(id).expect("Every id has an entry set");
            codec::put_len(out, entries.len());
            for (ts, positive, negative) in entries {
                ts.pack_into(out);
                codec::put_u64(out, *positive);
                codec::put_u64(out, *negative);
            }
        }
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let id_count = reader.u32()? as usize;
        let mut ids = BTreeMap::new();
        let mut entries: BTreeMap<Value, BTreeSet<(C::Timestamp, u64, u64)>> = BTreeMap::new();
        for _ in 0..id_count {
            let id = Value::unpack_from(reader, inject)?;
            let first_ts = C::Timestamp::unpack_from(reader, inject)?;
            let entry_count = reader.u32()? as usize;
            let mut id_entries = BTreeSet::new();
            for _ in 0..entry_count {
                let ts = C::Timestamp::unpack_from(reader, inject)?;
                let positive = reader.u64()?;
                let negative = reader.u64()?;
                id_entries.insert((ts, positive, negative));
            }
            ids.insert(id.clone(), first_ts);
            entries.insert(id, id_entries);
        }
        Ok(Self {
            clock,
            ids,
            entries,
            listeners: Listeners::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltasync_core::{ClockUuid, VectorClock};
    use itertools::Itertools;
    use maplit::btreemap;
    use std::num::NonZeroUsize;

    fn replica_of(set: &CounterSet) -> CounterSet {
        CounterSet::with_clock(LamportClock::with_uuid(set.clock_uuid().clone()))
    }

    #[test]
    fn members_are_installed_lazily_and_summed() {
        let mut set = CounterSet::new();
        set.increase(Value::from("alice"), 3).unwrap();
        set.increase(Value::from("bob"), 2).unwrap();
        set.decrease(Value::from("alice"), 1).unwrap();

        assert_eq!(set.read(), 4);
        assert_eq!(
            set.read_counters(),
            btreemap! {
                Value::from("alice") => 2i128,
                Value::from("bob") => 2i128,
            }
        );
        assert_eq!(
            set.counter_ids(),
            vec![Value::from("alice"), Value::from("bob")]
        );
    }

    #[test]
    fn per_writer_contributions_do_not_collide() {
        let uuid = ClockUuid::generate();
        let mut a = CounterSet::with_clock(LamportClock::with_uuid(uuid.clone()));
        let mut b = CounterSet::with_clock(LamportClock::with_uuid(uuid));

        // Both replicas step concurrently with identical stamps; distinct
        // ids keep the contributions apart.
        let from_a = a.increase(Value::from("a"), 1).unwrap();
        let from_b = b.increase(Value::from("b"), 1).unwrap();
        assert_eq!(from_a.ts(), from_b.ts());

        a.update(&from_b).unwrap();
        b.update(&from_a).unwrap();
        assert_eq!(a.read(), 2);
        assert_eq!(b.read(), 2);
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn deltas_commute_and_are_idempotent() {
        let mut source = CounterSet::new();
        let deltas = vec![
            source.increase(Value::from("a"), 5).unwrap(),
            source.decrease(Value::from("a"), 2).unwrap(),
            source.increase(Value::from("b"), 1).unwrap(),
        ];

        let mut previous: Option<CounterSet> = None;
        for perm in deltas.iter().permutations(deltas.len()) {
            let mut replica = replica_of(&source);
            for delta in perm {
                replica.update(delta).unwrap();
                replica.update(delta).unwrap();
            }
            assert_eq!(replica.read(), 4);
            if let Some(ref previous) = previous {
                assert_eq!(previous.pack(), replica.pack());
            }
            previous = Some(replica);
        }
    }

    #[test]
    fn concurrent_vector_stamp_steps_converge() {
        let uuid = ClockUuid::generate();
        let members = NonZeroUsize::new(2).unwrap();
        let mut a = CounterSet::with_clock(VectorClock::new(uuid.clone(), members, 0));
        let mut b = CounterSet::with_clock(VectorClock::new(uuid, members, 1));

        let from_a = a.increase(Value::from("a"), 1).unwrap();
        let from_b = b.increase(Value::from("b"), 2).unwrap();
        assert!(VectorClock::are_concurrent(from_a.ts(), from_b.ts()));

        a.update(&from_b).unwrap();
        b.update(&from_a).unwrap();
        assert_eq!(a.read(), 3);
        assert_eq!(b.read(), 3);
        assert_eq!(a.read_counters(), b.read_counters());
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn history_replay_and_pack_roundtrip() {
        let mut set = CounterSet::new();
        set.increase(Value::from("a"), 5).unwrap();
        set.decrease(Value::from("b"), 3).unwrap();

        let mut replica = replica_of(&set);
        for delta in set.history(None, None) {
            replica.update(&delta).unwrap();
        }
        assert_eq!(replica.read(), set.read());
        assert_eq!(replica.read_counters(), set.read_counters());
        assert_eq!(replica.checksums(None, None), set.checksums(None, None));

        let back = CounterSet::unpack(&set.pack(), &Inject::EMPTY).unwrap();
        assert_eq!(back, set);
    }
}
