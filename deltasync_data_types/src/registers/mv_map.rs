use super::{MapOp, mv_absorb};
use crate::sets::OrSetState;
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
    errors::{InvalidValueSnafu, ListenerRejectedSnafu},
    timestamp_in_range,
    value::Inject,
};
use snafu::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Payload of one multi-value map write.
///
/// `value` is the none sentinel exactly for unset operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MvMapDelta {
    pub op: MapOp,
    pub key: Value,
    pub value: Value,
}
impl MvMapDelta {
    fn validate(&self) -> Result<()> {
        let consistent = match self.op {
            MapOp::Set => !self.value.is_none(),
            MapOp::Unset => self.value.is_none(),
        };
        ensure!(
            consistent,
            InvalidValueSnafu {
                what: "map payload",
                reason: "set requires a value, unset requires the none sentinel".to_string(),
            }
        );
        Ok(())
    }
}
impl Packable for MvMapDelta {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.op.pack_into(out);
        self.key.pack_into(out);
        self.value.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            op: MapOp::unpack_from(reader, inject)?,
            key: Value::unpack_from(reader, inject)?,
            value: Value::unpack_from(reader, inject)?,
        })
    }
}

/// A map of multi-value registers behind an observed-remove key set.
///
/// Where [[super::LwwMap]] arbitrates concurrent writes per key, this keeps
/// them all, exactly like [[super::MvRegister]] does for a single slot.
#[derive(Clone, Debug, PartialEq)]
pub struct MvMap<C: Clock = LamportClock> {
    clock: C,
    keys: OrSetState<Value, C>,
    slots: BTreeMap<Value, BTreeSet<(C::Timestamp, Value)>>,
    listeners: Listeners<StateUpdate<MvMapDelta, C::Timestamp>>,
}
impl MvMap<LamportClock> {
    pub fn new() -> Self {
        Self::with_clock(LamportClock::new())
    }
}
impl Default for MvMap<LamportClock> {
    fn default() -> Self {
        Self::new()
    }
}
impl<C: Clock> MvMap<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            keys: OrSetState::new(),
            slots: BTreeMap::new(),
            listeners: Listeners::new(),
        }
    }

    pub fn set(
        &mut self,
        key: Value,
        value: Value,
    ) -> Result<StateUpdate<MvMapDelta, C::Timestamp>> {
        self.emit(MvMapDelta {
            op: MapOp::Set,
            key,
            value,
        })
    }

    pub fn unset(&mut self, key: Value) -> Result<StateUpdate<MvMapDelta, C::Timestamp>> {
        self.emit(MvMapDelta {
            op: MapOp::Unset,
            key,
            value: Value::None,
        })
    }

    fn emit(&mut self, data: MvMapDelta) -> Result<StateUpdate<MvMapDelta, C::Timestamp>> {
        data.validate()?;
        let ts = self.clock.tick();
        let delta = StateUpdate::new(self.clock.uuid().clone(), ts, data);
        self.update(&delta)?;
        Ok(delta)
    }

    /// The surviving real values of `key`, sorted and deduplicated.
    pub fn get(&self, key: &Value) -> Vec<Value> {
        if !self.keys.is_visible(key) {
            return Vec::new();
        }
        let Some(entries) = self.slots.get(key) else {
            return Vec::new();
        };
        let values: BTreeSet<&Value> = entries
            .iter()
            .map(|(_, value)| value)
            .filter(|value| !value.is_none())
            .collect();
        values.into_iter().cloned().collect()
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        !self.get(key).is_empty()
    }
}
impl<C: Clock> DeltaCrdt for MvMap<C> {
    type Clock = C;
    type Payload = MvMapDelta;
    type View = Vec<(Value, Vec<Value>)>;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&self) -> Vec<(Value, Vec<Value>)> {
        self.slots
            .keys()
            .filter_map(|key| {
                let values = self.get(key);
                if values.is_empty() {
                    None
                } else {
                    Some((key.clone(), values))
                }
            })
            .collect()
    }

    fn update(&mut self, delta: &StateUpdate<MvMapDelta, C::Timestamp>) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        delta.data().validate()?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());

        let key = delta.data().key.clone();
        match delta.data().op {
            MapOp::Set => self.keys.observe(key.clone(), delta.ts().clone()),
            MapOp::Unset => self.keys.remove(key.clone(), delta.ts().clone()),
        };
        let entries = self.slots.entry(key).or_default();
        mv_absorb::<C>(entries, delta.ts(), &delta.data().value);
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<MvMapDelta, C::Timestamp>> {
        self.slots
            .iter()
            .flat_map(|(key, entries)| {
                entries
                    .iter()
                    .filter(|(ts, _)| timestamp_in_range::<C>(ts, from, until))
                    .map(|(ts, value)| {
                        let op = if value.is_none() {
                            MapOp::Unset
                        } else {
                            MapOp::Set
                        };
                        StateUpdate::new(
                            self.clock.uuid().clone(),
                            ts.clone(),
                            MvMapDelta {
                                op,
                                key: key.clone(),
                                value: value.clone(),
                            },
                        )
                    })
            })
            .collect()
    }

    fn listeners(&self) -> &Listeners<StateUpdate<MvMapDelta, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(&mut self) -> &mut Listeners<StateUpdate<MvMapDelta, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> Packable for MvMap<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        codec::put_len(out, self.keys.observed_len());
        for (key, ts) in self.keys.iter_observed() {
            key.pack_into(out);
            ts.pack_into(out);
        }
        codec::put_len(out, self.keys.removed_len());
        for (key, ts) in self.keys.iter_removed() {
            key.pack_into(out);
            ts.pack_into(out);
        }
        codec::put_len(out, self.slots.len());
        for (key, entries) in &self.slots {
            key.pack_into(out);
            codec::put_len(out, entries.len());
            for (ts, value) in entries {
                ts.pack_into(out);
                value.pack_into(out);
            }
        }
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let mut keys = OrSetState::new();
        let observed_count = reader.u32()? as usize;
        for _ in 0..observed_count {
            let key = Value::unpack_from(reader, inject)?;
            let ts = C::Timestamp::unpack_from(reader, inject)?;
            keys.insert_observed(key, ts);
        }
        let removed_count = reader.u32()? as usize;
        for _ in 0..removed_count {
            let key = Value::unpack_from(reader, inject)?;
            let ts = C::Timestamp::unpack_from(reader, inject)?;
            keys.insert_removed(key, ts);
        }
        let slot_count = reader.u32()? as usize;
        let mut slots: BTreeMap<Value, BTreeSet<(C::Timestamp, Value)>> = BTreeMap::new();
        for _ in 0..slot_count {
            let key = Value::unpack_from(reader, inject)?;
            let entry_count = reader.u32()? as usize;
            let mut entries = BTreeSet::new();
            for _ in 0..entry_count {
                let ts = C::Timestamp::unpack_from(reader, inject)?;
                let value = Value::unpack_from(reader, inject)?;
                entries.insert((ts, value));
            }
            slots.insert(key, entries);
        }
        Ok(Self {
            clock,
            keys,
            slots,
            listeners: Listeners::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltasync_core::{ClockUuid, VectorClock};
    use itertools::Itertools;
    use std::num::NonZeroUsize;

    fn replica_of(map: &MvMap) -> MvMap {
        MvMap::with_clock(LamportClock::with_uuid(map.clock_uuid().clone()))
    }

    #[test]
    fn set_unset_lifecycle() {
        let mut map = MvMap::new();
        map.set(Value::from("k"), Value::Int(1)).unwrap();
        assert_eq!(map.get(&Value::from("k")), vec![Value::Int(1)]);

        map.set(Value::from("k"), Value::Int(2)).unwrap();
        assert_eq!(map.get(&Value::from("k")), vec![Value::Int(2)]);

        map.unset(Value::from("k")).unwrap();
        assert!(map.get(&Value::from("k")).is_empty());
        assert!(map.read().is_empty());
    }

    #[test]
    fn concurrent_writes_are_all_visible() {
        let uuid = ClockUuid::generate();
        let mut a = MvMap::with_clock(LamportClock::with_uuid(uuid.clone()));
        let mut b = MvMap::with_clock(LamportClock::with_uuid(uuid));

        let write_a = a.set(Value::from("k"), Value::Int(10)).unwrap();
        let write_b = b.set(Value::from("k"), Value::Int(20)).unwrap();

        a.update(&write_b).unwrap();
        b.update(&write_a).unwrap();

        assert_eq!(a.get(&Value::from("k")), vec![Value::Int(10), Value::Int(20)]);
        assert_eq!(b.get(&Value::from("k")), a.get(&Value::from("k")));
        assert_eq!(a.pack(), b.pack());
        assert_eq!(
            a.read(),
            vec![(Value::from("k"), vec![Value::Int(10), Value::Int(20)])]
        );
    }

    #[test]
    fn concurrent_vector_stamp_writes_are_all_kept() {
        let uuid = ClockUuid::generate();
        let members = NonZeroUsize::new(2).unwrap();
        let mut a = MvMap::with_clock(VectorClock::new(uuid.clone(), members, 0));
        let mut b = MvMap::with_clock(VectorClock::new(uuid, members, 1));

        let write_a = a.set(Value::from("k"), Value::Int(10)).unwrap();
        let write_b = b.set(Value::from("k"), Value::Int(20)).unwrap();
        assert!(VectorClock::are_concurrent(write_a.ts(), write_b.ts()));

        a.update(&write_b).unwrap();
        b.update(&write_a).unwrap();

        assert_eq!(a.get(&Value::from("k")), vec![Value::Int(10), Value::Int(20)]);
        assert_eq!(b.get(&Value::from("k")), a.get(&Value::from("k")));
        assert_eq!(a.pack(), b.pack());

        // A causally-later unset dominates both branches.
        let unset = b.unset(Value::from("k")).unwrap();
        a.update(&unset).unwrap();
        assert!(a.get(&Value::from("k")).is_empty());
        assert!(b.get(&Value::from("k")).is_empty());
    }

    #[test]
    fn deltas_commute_and_are_idempotent() {
        let mut source = MvMap::new();
        let deltas = vec![
            source.set(Value::from("a"), Value::Int(1)).unwrap(),
            source.set(Value::from("b"), Value::Int(2)).unwrap(),
            source.unset(Value::from("a")).unwrap(),
        ];

        let mut previous: Option<MvMap> = None;
        for perm in deltas.iter().permutations(deltas.len()) {
            let mut replica = replica_of(&source);
            for delta in perm {
                replica.update(delta).unwrap();
                replica.update(delta).unwrap();
            }
            assert_eq!(
                replica.read(),
                vec![(Value::from("b"), vec![Value::Int(2)])]
            );
            if let Some(ref previous) = previous {
                assert_eq!(previous.pack(), replica.pack());
            }
            previous = Some(replica);
        }
    }

    #[test]
    fn history_replay_and_pack_roundtrip() {
        let mut map = MvMap::new();
        map.set(Value::from("a"), Value::Int(1)).unwrap();
        map.set(Value::from("b"), Value::Int(2)).unwrap();
        map.unset(Value::from("b")).unwrap();

        let mut replica = replica_of(&map);
        for delta in map.history(None, None) {
            replica.update(&delta).unwrap();
        }
        assert_eq!(replica.read(), map.read());
        assert_eq!(replica.checksums(None, None), map.checksums(None, None));

        let back = MvMap::unpack(&map.pack(), &Inject::EMPTY).unwrap();
        assert_eq!(back, map);
    }
}
