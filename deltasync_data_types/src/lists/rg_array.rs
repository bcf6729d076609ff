use super::ListCrdt;
use crate::sets::{OrSetState, Transition};
use deltasync_core::{
    Clock,
    DeltaCrdt,
    LamportClock,
    Listeners,
    Packable,
    Result,
    StateUpdate,
    Value,
    codec::{self, ByteReader, CodecError, UnknownTagSnafu},
    errors::{ListenerRejectedSnafu, OutOfBoundsSnafu},
    timestamp_in_range,
    value::Inject,
};
use snafu::prelude::*;
use std::cmp;

/// One list item with the metadata that positions it.
///
/// The list order is ascending `(ts, writer, serialized value)`; the
/// manual [[Ord]] implements exactly that.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemWrapper<TS> {
    pub value: Value,
    pub ts: TS,
    pub writer: Value,
}
impl<TS: Ord> Ord for ItemWrapper<TS> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.ts
            .cmp(&other.ts)
            .then_with(|| self.writer.cmp(&other.writer))
            .then_with(|| self.value.cmp(&other.value))
    }
}
impl<TS: Ord> PartialOrd for ItemWrapper<TS> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<TS: Packable> Packable for ItemWrapper<TS> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.value.pack_into(out);
        self.ts.pack_into(out);
        self.writer.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            value: Value::unpack_from(reader, inject)?,
            ts: TS::unpack_from(reader, inject)?,
            writer: Value::unpack_from(reader, inject)?,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RgaOp {
    Append,
    Delete,
}
impl Packable for RgaOp {
    fn pack_into(&self, out: &mut Vec<u8>) {
        codec::put_u8(
            out,
            match self {
                RgaOp::Append => 0,
                RgaOp::Delete => 1,
            },
        );
    }

    fn unpack_from(reader: &mut ByteReader<'_>, _inject: &Inject) -> Result<Self, CodecError> {
        match reader.u8()? {
            0 => Ok(RgaOp::Append),
            1 => Ok(RgaOp::Delete),
            tag => UnknownTagSnafu {
                tag,
                what: "list operation",
            }
            .fail(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RgaDelta<TS> {
    pub op: RgaOp,
    pub item: ItemWrapper<TS>,
}
impl<TS: Packable> Packable for RgaDelta<TS> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.op.pack_into(out);
        self.item.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            op: RgaOp::unpack_from(reader, inject)?,
            item: ItemWrapper::unpack_from(reader, inject)?,
        })
    }
}

/// A replicated growable array: append-anywhere-in-time, delete by item.
///
/// Items live in an observed-remove set of [[ItemWrapper]]s; the visible
/// ones are kept in a sorted cache that is patched by binary search on every
/// visibility flip.
#[derive(Clone, Debug, PartialEq)]
pub struct RgArray<C: Clock = LamportClock> {
    clock: C,
    items: OrSetState<ItemWrapper<C::Timestamp>, C>,
    cache: Vec<ItemWrapper<C::Timestamp>>,
    listeners: Listeners<StateUpdate<RgaDelta<C::Timestamp>, C::Timestamp>>,
}
impl RgArray<LamportClock> {
    pub fn new() -> Self {
        Self::with_clock(LamportClock::new())
    }
}
impl Default for RgArray<LamportClock> {
    fn default() -> Self {
        Self::new()
    }
}
impl<C: Clock> RgArray<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            items: OrSetState::new(),
            cache: Vec::new(),
            listeners: Listeners::new(),
        }
    }

    /// Append `value`, stamped with the clock's next timestamp.
    pub fn append(
        &mut self,
        value: Value,
        writer: Value,
    ) -> Result<StateUpdate<RgaDelta<C::Timestamp>, C::Timestamp>> {
        let ts = self.clock.tick();
        let item = ItemWrapper {
            value,
            ts: ts.clone(),
            writer,
        };
        let delta = StateUpdate::new(
            self.clock.uuid().clone(),
            ts,
            RgaDelta {
                op: RgaOp::Append,
                item,
            },
        );
        self.update(&delta)?;
        Ok(delta)
    }

    /// Delete one concrete item (from [[RgArray::read_full]]).
    pub fn delete(
        &mut self,
        item: ItemWrapper<C::Timestamp>,
    ) -> Result<StateUpdate<RgaDelta<C::Timestamp>, C::Timestamp>> {
        let ts = self.clock.tick();
        let delta = StateUpdate::new(
            self.clock.uuid().clone(),
            ts,
            RgaDelta {
                op: RgaOp::Delete,
                item,
            },
        );
        self.update(&delta)?;
        Ok(delta)
    }

    /// The visible items with their ordering metadata, in list order.
    pub fn read_full(&self) -> &[ItemWrapper<C::Timestamp>] {
        &self.cache
    }

    /// Rebuild the sorted cache from scratch.
    ///
    /// Equivalent to the incremental maintenance; exists for recovery and
    /// for [[Packable::unpack]].
    pub fn calculate_cache(&mut self) {
        let mut cache: Vec<ItemWrapper<C::Timestamp>> =
            self.items.iter_visible().cloned().collect();
        cache.sort_unstable();
        self.cache = cache;
    }

    fn update_cache(&mut self, item: &ItemWrapper<C::Timestamp>, transition: Transition) {
        match (transition.was_visible, transition.now_visible) {
            (false, true) => {
                if let Err(position) = self.cache.binary_search(item) {
                    self.cache.insert(position, item.clone());
                }
            }
            (true, false) => {
                if let Ok(position) = self.cache.binary_search(item) {
                    self.cache.remove(position);
                }
            }
            _ => {}
        }
    }
}
impl<C: Clock> DeltaCrdt for RgArray<C> {
    type Clock = C;
    type Payload = RgaDelta<C::Timestamp>;
    type View = Vec<Value>;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&self) -> Vec<Value> {
        self.cache.iter().map(|item| item.value.clone()).collect()
    }

    fn update(
        &mut self,
        delta: &StateUpdate<RgaDelta<C::Timestamp>, C::Timestamp>,
    ) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());
        let item = delta.data().item.clone();
        let transition = match delta.data().op {
            RgaOp::Append => self.items.observe(item.clone(), delta.ts().clone()),
            RgaOp::Delete => self.items.remove(item.clone(), delta.ts().clone()),
        };
        self.update_cache(&item, transition);
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<RgaDelta<C::Timestamp>, C::Timestamp>> {
        let appends = self
            .items
            .iter_observed()
            .filter(|(_, ts)| timestamp_in_range::<C>(ts, from, until))
            .map(|(item, ts)| {
                StateUpdate::new(
                    self.clock.uuid().clone(),
                    ts.clone(),
                    RgaDelta {
                        op: RgaOp::Append,
                        item: item.clone(),
                    },
                )
            });
        let deletes = self
            .items
            .iter_removed()
            .filter(|(_, ts)| timestamp_in_range::<C>(ts, from, until))
            .map(|(item, ts)| {
                StateUpdate::new(
                    self.clock.uuid().clone(),
                    ts.clone(),
                    RgaDelta {
                        op: RgaOp::Delete,
                        item: item.clone(),
                    },
                )
            });
        appends.chain(deletes).collect()
    }

    fn listeners(&self) -> &Listeners<StateUpdate<RgaDelta<C::Timestamp>, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(
        &mut self,
    ) -> &mut Listeners<StateUpdate<RgaDelta<C::Timestamp>, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> ListCrdt for RgArray<C> {
    fn list_len(&self) -> usize {
        self.cache.len()
    }

    fn read_list(&self) -> Vec<Value> {
        self.read()
    }

    fn append_value(
        &mut self,
        value: Value,
        writer: &Value,
    ) -> Result<StateUpdate<RgaDelta<C::Timestamp>, C::Timestamp>> {
        self.append(value, writer.clone())
    }

    fn remove_at(
        &mut self,
        index: usize,
        _writer: &Value,
    ) -> Result<StateUpdate<RgaDelta<C::Timestamp>, C::Timestamp>> {
        ensure!(
            index < self.cache.len(),
            OutOfBoundsSnafu {
                index,
                len: self.cache.len(),
            }
        );
        let item = self.cache[index].clone();
        self.delete(item)
    }
}
impl<C: Clock> Packable for RgArray<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        codec::put_len(out, self.items.observed_len());
        for (item, ts) in self.items.iter_observed() {
            item.pack_into(out);
            ts.pack_into(out);
        }
        codec::put_len(out, self.items.removed_len());
        for (item, ts) in self.items.iter_removed() {
            item.pack_into(out);
            ts.pack_into(out);
        }
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let mut items = OrSetState::new();
        let observed_count = reader.u32()? as usize;
        for _ in 0..observed_count {
            let item = ItemWrapper::unpack_from(reader, inject)?;
            let ts = C::Timestamp::unpack_from(reader, inject)?;
            items.insert_observed(item, ts);
        }
        let removed_count = reader.u32()? as usize;
        for _ in 0..removed_count {
            let item = ItemWrapper::unpack_from(reader, inject)?;
            let ts = C::Timestamp::unpack_from(reader, inject)?;
            items.insert_removed(item, ts);
        }
        let mut array = Self {
            clock,
            items,
            cache: Vec::new(),
            listeners: Listeners::new(),
        };
        array.calculate_cache();
        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltasync_core::{ClockUuid, CrdtError, VectorClock};
    use itertools::Itertools;
    use std::num::NonZeroUsize;

    fn replica_of(array: &RgArray) -> RgArray {
        RgArray::with_clock(LamportClock::with_uuid(array.clock_uuid().clone()))
    }

    #[test]
    fn appends_read_in_stamp_order() {
        let mut array = RgArray::new();
        array.append(Value::from("a"), Value::Int(1)).unwrap();
        array.append(Value::from("b"), Value::Int(1)).unwrap();
        array.append(Value::from("c"), Value::Int(1)).unwrap();

        assert_eq!(
            array.read(),
            vec![Value::from("a"), Value::from("b"), Value::from("c")]
        );
        assert_eq!(array.list_len(), 3);
    }

    #[test]
    fn delete_hides_the_item_and_survives_reorder() {
        let mut array = RgArray::new();
        array.append(Value::from("a"), Value::Int(1)).unwrap();
        array.append(Value::from("b"), Value::Int(1)).unwrap();

        let item = array.read_full()[0].clone();
        let delete = array.delete(item).unwrap();
        assert_eq!(array.read(), vec![Value::from("b")]);

        // A replica receiving the delete before the appends converges too.
        let mut replica = replica_of(&array);
        replica.update(&delete).unwrap();
        for delta in array.history(None, None) {
            replica.update(&delta).unwrap();
        }
        assert_eq!(replica.read(), vec![Value::from("b")]);
    }

    #[test]
    fn equal_stamps_order_by_writer_then_value() {
        let uuid = ClockUuid::generate();
        let mut a = RgArray::with_clock(LamportClock::with_uuid(uuid.clone()));
        let mut b = RgArray::with_clock(LamportClock::with_uuid(uuid));

        // Concurrent appends with identical stamps.
        let from_a = a.append(Value::from("za"), Value::Int(1)).unwrap();
        let from_b = b.append(Value::from("ab"), Value::Int(2)).unwrap();
        assert_eq!(from_a.ts(), from_b.ts());

        a.update(&from_b).unwrap();
        b.update(&from_a).unwrap();

        // Writer 1 sorts before writer 2, regardless of the values.
        assert_eq!(a.read(), vec![Value::from("za"), Value::from("ab")]);
        assert_eq!(b.read(), a.read());
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn concurrent_vector_stamp_appends_converge() {
        let uuid = ClockUuid::generate();
        let members = NonZeroUsize::new(2).unwrap();
        let mut a = RgArray::with_clock(VectorClock::new(uuid.clone(), members, 0));
        let mut b = RgArray::with_clock(VectorClock::new(uuid, members, 1));

        let from_a = a.append(Value::from("left"), Value::Int(1)).unwrap();
        let from_b = b.append(Value::from("right"), Value::Int(2)).unwrap();
        assert!(VectorClock::are_concurrent(from_a.ts(), from_b.ts()));

        a.update(&from_b).unwrap();
        b.update(&from_a).unwrap();

        // Concurrent stamps order by the storage order of the stamps
        // themselves, the same on every replica.
        assert_eq!(a.read(), vec![Value::from("right"), Value::from("left")]);
        assert_eq!(b.read(), a.read());
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn remove_at_checks_bounds() {
        let mut array = RgArray::new();
        array.append(Value::from("a"), Value::Int(1)).unwrap();

        let err = array.remove_at(5, &Value::Int(1)).unwrap_err();
        assert!(matches!(err, CrdtError::OutOfBounds { index: 5, len: 1 }));

        array.remove_at(0, &Value::Int(1)).unwrap();
        assert!(array.is_list_empty());
    }

    #[test]
    fn deltas_commute_and_are_idempotent() {
        let mut source = RgArray::new();
        let mut deltas = vec![
            source.append(Value::from("a"), Value::Int(1)).unwrap(),
            source.append(Value::from("b"), Value::Int(1)).unwrap(),
            source.append(Value::from("c"), Value::Int(1)).unwrap(),
        ];
        deltas.push(source.remove_at(1, &Value::Int(1)).unwrap());

        let mut previous: Option<RgArray> = None;
        for perm in deltas.iter().permutations(deltas.len()) {
            let mut replica = replica_of(&source);
            for delta in perm {
                replica.update(delta).unwrap();
                replica.update(delta).unwrap();
            }
            assert_eq!(replica.read(), vec![Value::from("a"), Value::from("c")]);
            if let Some(ref previous) = previous {
                assert_eq!(previous.pack(), replica.pack());
            }
            previous = Some(replica);
        }
    }

    #[test]
    fn cache_matches_full_rebuild() {
        let mut array = RgArray::new();
        for i in 0..10 {
            array.append(Value::Int(i), Value::Int(1)).unwrap();
        }
        array.remove_at(3, &Value::Int(1)).unwrap();
        array.remove_at(0, &Value::Int(1)).unwrap();

        let incremental = array.read();
        array.calculate_cache();
        assert_eq!(array.read(), incremental);
    }

    #[test]
    fn history_replay_and_pack_roundtrip() {
        let mut array = RgArray::new();
        array.append(Value::from("a"), Value::Int(1)).unwrap();
        array.append(Value::from("b"), Value::Int(2)).unwrap();
        array.remove_at(0, &Value::Int(1)).unwrap();

        let mut replica = replica_of(&array);
        for delta in array.history(None, None) {
            replica.update(&delta).unwrap();
        }
        assert_eq!(replica.read(), array.read());
        assert_eq!(replica.checksums(None, None), array.checksums(None, None));

        let back = RgArray::unpack(&array.pack(), &Inject::EMPTY).unwrap();
        assert_eq!(back, array);
        assert_eq!(back.read(), array.read());
    }

    #[test]
    fn merkle_sync_converges() {
        let uuid = ClockUuid::generate();
        let mut a = RgArray::with_clock(LamportClock::with_uuid(uuid.clone()));
        let mut b = RgArray::with_clock(LamportClock::with_uuid(uuid));

        a.append(Value::from("left"), Value::Int(1)).unwrap();
        b.append(Value::from("right"), Value::Int(2)).unwrap();

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

        assert_eq!(a.read(), b.read());
        assert_eq!(a.get_merkle_history().root(), b.get_merkle_history().root());
    }
}
