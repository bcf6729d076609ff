use super::{ListCrdt, generate_item_uuid};
use crate::registers::{LwwMapDelta, LwwMapState, MapOp, MapTransition};
use bigdecimal::{BigDecimal, One, Zero};
use deltasync_core::{
    Clock,
    DeltaCrdt,
    LamportClock,
    Listeners,
    Packable,
    Result,
    StateUpdate,
    Value,
    codec::{ByteReader, CodecError, InconsistentSnafu},
    errors::{
        InvalidValueSnafu,
        ListenerRejectedSnafu,
        MissingItemSnafu,
        OutOfBoundsSnafu,
        WrongTypeSnafu,
    },
    value::Inject,
};
use num_bigint::BigInt;
use rand::Rng;
use snafu::prelude::*;
use std::cmp;

/// One positioned list item.
///
/// The index is an arbitrary-precision decimal; the list order is ascending
/// by `(index, uuid)`, so items that end up with an identical index still
/// order deterministically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FiaItem {
    pub value: Value,
    pub index: BigDecimal,
    pub uuid: Vec<u8>,
}
impl FiaItem {
    pub(crate) fn encode(&self) -> Value {
        Value::List(vec![
            self.value.clone(),
            Value::Decimal(self.index.clone()),
            Value::Bytes(self.uuid.clone()),
        ])
    }

    pub(crate) fn decode(value: &Value) -> Result<Self> {
        let Value::List(parts) = value else {
            return WrongTypeSnafu {
                what: "list item",
                expected: "a (value, index, uuid) sequence",
            }
            .fail();
        };
        let [item_value, index, uuid] = parts.as_slice() else {
            return WrongTypeSnafu {
                what: "list item",
                expected: "a (value, index, uuid) sequence",
            }
            .fail();
        };
        let Value::Decimal(index) = index else {
            return WrongTypeSnafu {
                what: "list item index",
                expected: "a decimal",
            }
            .fail();
        };
        let Value::Bytes(uuid) = uuid else {
            return WrongTypeSnafu {
                what: "list item uuid",
                expected: "a byte sequence",
            }
            .fail();
        };
        ensure!(
            !uuid.is_empty(),
            InvalidValueSnafu {
                what: "list item uuid",
                reason: "must not be empty".to_string(),
            }
        );
        ensure!(
            index > &BigDecimal::zero(),
            InvalidValueSnafu {
                what: "list item index",
                reason: "must be positive".to_string(),
            }
        );
        Ok(Self {
            value: item_value.clone(),
            index: index.clone(),
            uuid: uuid.clone(),
        })
    }
}

fn order_key(a: &FiaItem, b: &FiaItem) -> cmp::Ordering {
    a.index.cmp(&b.index).then_with(|| a.uuid.cmp(&b.uuid))
}

/// Where [[FiArray::move_item]] should place the item. Exactly one target
/// form is given per move.
#[derive(Clone, Debug, PartialEq)]
pub enum MoveTarget {
    /// An explicit new index.
    Index(BigDecimal),
    /// Directly before the item with this uuid.
    Before(Vec<u8>),
    /// Directly after the item with this uuid.
    After(Vec<u8>),
}

/// An ordered list over fractional indices in (0, 1).
///
/// Positions are allocated by midpoint subdivision with a small random
/// offset, so concurrent inserts into the same slot almost certainly get
/// distinct indices. Item assignments live in an embedded last-writer-wins
/// map keyed by item uuid; concurrent moves of one item converge through
/// that map's arbitration.
#[derive(Clone, Debug, PartialEq)]
pub struct FiArray<C: Clock = LamportClock> {
    clock: C,
    map: LwwMapState<C>,
    cache: Vec<FiaItem>,
    listeners: Listeners<StateUpdate<LwwMapDelta, C::Timestamp>>,
}
impl FiArray<LamportClock> {
    pub fn new() -> Self {
        Self::with_clock(LamportClock::new())
    }
}
impl Default for FiArray<LamportClock> {
    fn default() -> Self {
        Self::new()
    }
}
impl<C: Clock> FiArray<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            map: LwwMapState::new(),
            cache: Vec::new(),
            listeners: Listeners::new(),
        }
    }

    /// The visible items with their indices, in list order.
    pub fn read_full(&self) -> &[FiaItem] {
        &self.cache
    }

    /// Place `value` at an explicit `index` under a fresh uuid.
    pub fn put(
        &mut self,
        value: Value,
        writer: Value,
        index: BigDecimal,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        ensure!(
            index > BigDecimal::zero(),
            InvalidValueSnafu {
                what: "list item index",
                reason: "must be positive".to_string(),
            }
        );
        let item = FiaItem {
            value,
            index,
            uuid: generate_item_uuid(),
        };
        self.put_item(item, writer)
    }

    /// Insert before the current first item.
    pub fn put_first(
        &mut self,
        value: Value,
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let high = match self.cache.first() {
            Some(first) => first.index.clone(),
            None => BigDecimal::one(),
        };
        let index = index_between(&BigDecimal::zero(), &high);
        self.put(value, writer, index)
    }

    /// Insert after the current last item.
    pub fn put_last(
        &mut self,
        value: Value,
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let index = match self.cache.last() {
            Some(last) if last.index < BigDecimal::one() => {
                index_between(&last.index, &BigDecimal::one())
            }
            // The tail has grown past 1 through appends; keep extending it.
            Some(last) => &last.index + append_step(),
            None => index_between(&BigDecimal::zero(), &BigDecimal::one()),
        };
        self.put(value, writer, index)
    }

    /// Insert between two concrete items.
    pub fn put_between(
        &mut self,
        value: Value,
        writer: Value,
        first: &FiaItem,
        second: &FiaItem,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let (low, high) = if first.index <= second.index {
            (&first.index, &second.index)
        } else {
            (&second.index, &first.index)
        };
        ensure!(
            low < high,
            InvalidValueSnafu {
                what: "anchor items",
                reason: "share the same index".to_string(),
            }
        );
        let index = index_between(low, high);
        self.put(value, writer, index)
    }

    /// Insert directly before the item with `anchor_uuid`.
    pub fn put_before(
        &mut self,
        value: Value,
        writer: Value,
        anchor_uuid: &[u8],
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let index = self.index_before(anchor_uuid)?;
        self.put(value, writer, index)
    }

    /// Insert directly after the item with `anchor_uuid`.
    pub fn put_after(
        &mut self,
        value: Value,
        writer: Value,
        anchor_uuid: &[u8],
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let index = self.index_after(anchor_uuid)?;
        self.put(value, writer, index)
    }

    /// Add at the end by a fixed tiny step instead of subdividing the
    /// remaining space.
    ///
    /// This exhausts the index space far more slowly than repeated
    /// [[FiArray::put_last]]; [[FiArray::normalize]] redistributes when
    /// needed.
    pub fn append(
        &mut self,
        value: Value,
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let base = match self.cache.last() {
            Some(last) => last.index.clone(),
            None => BigDecimal::zero(),
        };
        self.put(value, writer, base + append_step())
    }

    /// Re-position one item; its uuid and value are unchanged.
    pub fn move_item(
        &mut self,
        item_uuid: &[u8],
        target: MoveTarget,
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let position = self.position_of(item_uuid).context(MissingItemSnafu {
            what: format!("list item {}", hex::encode(item_uuid)),
        })?;
        let index = match target {
            MoveTarget::Index(index) => {
                ensure!(
                    index > BigDecimal::zero(),
                    InvalidValueSnafu {
                        what: "list item index",
                        reason: "must be positive".to_string(),
                    }
                );
                index
            }
            MoveTarget::Before(anchor_uuid) => self.index_before(&anchor_uuid)?,
            MoveTarget::After(anchor_uuid) => self.index_after(&anchor_uuid)?,
        };
        let item = FiaItem {
            value: self.cache[position].value.clone(),
            index,
            uuid: item_uuid.to_vec(),
        };
        self.put_item(item, writer)
    }

    /// Remove the item with `item_uuid` from the list view.
    ///
    /// Removing an unknown uuid is permitted and acts as a preemptive
    /// tombstone in the underlying key set.
    pub fn delete(
        &mut self,
        item_uuid: &[u8],
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        self.emit(LwwMapDelta {
            op: MapOp::Unset,
            key: Value::Bytes(item_uuid.to_vec()),
            value: Value::None,
            writer,
        })
    }

    /// Redistribute all visible indices evenly across (0, `max_index`).
    ///
    /// Emits one map write per item and applies each as it is produced.
    /// Expensive; meant for occasional maintenance when the index space has
    /// grown crowded.
    pub fn normalize(
        &mut self,
        max_index: BigDecimal,
        writer: Value,
    ) -> Result<Vec<StateUpdate<LwwMapDelta, C::Timestamp>>> {
        ensure!(
            max_index > BigDecimal::zero(),
            InvalidValueSnafu {
                what: "normalize bound",
                reason: "must be positive".to_string(),
            }
        );
        let items = self.cache.clone();
        let slots = BigDecimal::from((items.len() + 1) as u64);
        let mut updates = Vec::with_capacity(items.len());
        for (position, item) in items.into_iter().enumerate() {
            let numerator = BigDecimal::from((position + 1) as u64);
            let index = &max_index * numerator / &slots;
            let update = self.put_item(
                FiaItem {
                    value: item.value,
                    index,
                    uuid: item.uuid,
                },
                writer.clone(),
            )?;
            updates.push(update);
        }
        Ok(updates)
    }

    /// Rebuild the order cache from the underlying map.
    pub fn calculate_cache(&mut self) -> Result<()> {
        let mut cache = Vec::new();
        for (key, value) in self.map.iter_visible() {
            let item = Self::checked_item(key, value)?;
            cache.push(item);
        }
        cache.sort_unstable_by(order_key);
        self.cache = cache;
        Ok(())
    }

    fn put_item(
        &mut self,
        item: FiaItem,
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        self.emit(LwwMapDelta {
            op: MapOp::Set,
            key: Value::Bytes(item.uuid.clone()),
            value: item.encode(),
            writer,
        })
    }

    fn emit(&mut self, data: LwwMapDelta) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let ts = self.clock.tick();
        let delta = StateUpdate::new(self.clock.uuid().clone(), ts, data);
        self.update(&delta)?;
        Ok(delta)
    }

    fn position_of(&self, item_uuid: &[u8]) -> Option<usize> {
        self.cache.iter().position(|item| item.uuid == item_uuid)
    }

    fn index_before(&self, anchor_uuid: &[u8]) -> Result<BigDecimal> {
        let position = self.position_of(anchor_uuid).context(MissingItemSnafu {
            what: format!("anchor item {}", hex::encode(anchor_uuid)),
        })?;
        let low = if position == 0 {
            BigDecimal::zero()
        } else {
            self.cache[position - 1].index.clone()
        };
        Ok(index_between(&low, &self.cache[position].index))
    }

    fn index_after(&self, anchor_uuid: &[u8]) -> Result<BigDecimal> {
        let position = self.position_of(anchor_uuid).context(MissingItemSnafu {
            what: format!("anchor item {}", hex::encode(anchor_uuid)),
        })?;
        let anchor_index = &self.cache[position].index;
        match self.cache.get(position + 1) {
            Some(next) => Ok(index_between(anchor_index, &next.index)),
            None if anchor_index < &BigDecimal::one() => {
                Ok(index_between(anchor_index, &BigDecimal::one()))
            }
            None => Ok(anchor_index + append_step()),
        }
    }

    /// Validate that a map payload carries a well-formed item under its own
    /// uuid key.
    fn validate_payload(data: &LwwMapDelta) -> Result<()> {
        LwwMapState::<C>::validate(data)?;
        let Value::Bytes(key_uuid) = &data.key else {
            return WrongTypeSnafu {
                what: "list item key",
                expected: "a byte sequence",
            }
            .fail();
        };
        if data.op == MapOp::Set {
            let item = FiaItem::decode(&data.value)?;
            ensure!(
                &item.uuid == key_uuid,
                InvalidValueSnafu {
                    what: "list item",
                    reason: "uuid does not match its key".to_string(),
                }
            );
        }
        Ok(())
    }

    fn checked_item(key: &Value, value: &Value) -> Result<FiaItem> {
        let item = FiaItem::decode(value)?;
        ensure!(
            matches!(key, Value::Bytes(uuid) if uuid == &item.uuid),
            InvalidValueSnafu {
                what: "list item",
                reason: "uuid does not match its key".to_string(),
            }
        );
        Ok(item)
    }

    fn update_cache(&mut self, transition: &MapTransition) {
        if transition.was == transition.now {
            return;
        }
        if let Some(was_value) = &transition.was {
            let item = FiaItem::decode(was_value).expect("Cached items are validated on entry");
            if let Ok(position) = self
                .cache
                .binary_search_by(|probe| order_key(probe, &item))
            {
                self.cache.remove(position);
            }
        }
        if let Some(now_value) = &transition.now {
            let item = FiaItem::decode(now_value).expect("Applied items are validated on entry");
            if let Err(position) = self
                .cache
                .binary_search_by(|probe| order_key(probe, &item))
            {
                let colliding = position
                    .checked_sub(1)
                    .map(|left| self.cache[left].index == item.index)
                    .unwrap_or(false)
                    || self
                        .cache
                        .get(position)
                        .map(|right| right.index == item.index)
                        .unwrap_or(false);
                if colliding {
                    log::warn!(
                        "Fractional index collision at {}; ordering falls back to item uuids",
                        item.index
                    );
                }
                self.cache.insert(position, item);
            }
        }
    }
}
impl<C: Clock> DeltaCrdt for FiArray<C> {
    type Clock = C;
    type Payload = LwwMapDelta;
    type View = Vec<Value>;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&self) -> Vec<Value> {
        self.cache.iter().map(|item| item.value.clone()).collect()
    }

    fn update(&mut self, delta: &StateUpdate<LwwMapDelta, C::Timestamp>) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        Self::validate_payload(delta.data())?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());
        let transition = self.map.apply(delta.data(), delta.ts());
        self.update_cache(&transition);
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<LwwMapDelta, C::Timestamp>> {
        self.map
            .history_deltas(self.clock.uuid(), None, from, until)
    }

    fn listeners(&self) -> &Listeners<StateUpdate<LwwMapDelta, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(&mut self) -> &mut Listeners<StateUpdate<LwwMapDelta, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> ListCrdt for FiArray<C> {
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
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        self.append(value, writer.clone())
    }

    fn remove_at(
        &mut self,
        index: usize,
        writer: &Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        ensure!(
            index < self.cache.len(),
            OutOfBoundsSnafu {
                index,
                len: self.cache.len(),
            }
        );
        let uuid = self.cache[index].uuid.clone();
        self.delete(&uuid, writer.clone())
    }
}
impl<C: Clock> Packable for FiArray<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        self.map.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let map = LwwMapState::unpack_from(reader, inject)?;
        let mut array = Self {
            clock,
            map,
            cache: Vec::new(),
            listeners: Listeners::new(),
        };
        array.calculate_cache().map_err(|error| {
            InconsistentSnafu {
                reason: error.to_string(),
            }
            .build()
        })?;
        Ok(array)
    }
}

/// A point strictly between the bounds: the midpoint region, shifted by a
/// bounded random offset so concurrent inserts into the same slot diverge.
fn index_between(low: &BigDecimal, high: &BigDecimal) -> BigDecimal {
    debug_assert!(low <= high);
    let span = high - low;
    // Fraction in [384/1024, 639/1024], i.e. (0.37, 0.63).
    let jitter = rand::thread_rng().gen_range(384u32..640);
    low + span * BigDecimal::from(jitter) / BigDecimal::from(1024u32)
}

/// The fixed step used by append-mode inserts.
fn append_step() -> BigDecimal {
    BigDecimal::new(BigInt::from(1), 20)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltasync_core::{ClockUuid, CrdtError, VectorClock};
    use itertools::Itertools;
    use std::{num::NonZeroUsize, str::FromStr};

    fn replica_of(array: &FiArray) -> FiArray {
        FiArray::with_clock(LamportClock::with_uuid(array.clock_uuid().clone()))
    }

    fn decimal(text: &str) -> BigDecimal {
        BigDecimal::from_str(text).unwrap()
    }

    #[test]
    fn index_between_stays_strictly_inside() {
        for _ in 0..100 {
            let low = decimal("0.25");
            let high = decimal("0.5");
            let index = index_between(&low, &high);
            assert!(index > low && index < high, "{index} not in (0.25, 0.5)");
        }
    }

    #[test]
    fn put_first_and_last_keep_order() {
        let mut array = FiArray::new();
        array.put_last(Value::from("middle"), Value::Int(1)).unwrap();
        array.put_first(Value::from("start"), Value::Int(1)).unwrap();
        array.put_last(Value::from("end"), Value::Int(1)).unwrap();

        assert_eq!(
            array.read(),
            vec![Value::from("start"), Value::from("middle"), Value::from("end")]
        );

        let full = array.read_full();
        assert!(full[0].index < full[1].index);
        assert!(full[1].index < full[2].index);
        assert!(full[0].index > BigDecimal::zero());
        assert!(full[2].index < BigDecimal::one());
    }

    #[test]
    fn append_uses_the_fixed_step() {
        let mut array = FiArray::new();
        array.append(Value::Int(1), Value::Int(1)).unwrap();
        array.append(Value::Int(2), Value::Int(1)).unwrap();

        let full = array.read_full();
        assert_eq!(full[0].index, decimal("0.00000000000000000001"));
        assert_eq!(full[1].index, decimal("0.00000000000000000002"));
    }

    #[test]
    fn put_between_and_anchored_puts() {
        let mut array = FiArray::new();
        array.put(Value::from("a"), Value::Int(1), decimal("0.2")).unwrap();
        array.put(Value::from("c"), Value::Int(1), decimal("0.8")).unwrap();

        let (first, second) = (array.read_full()[0].clone(), array.read_full()[1].clone());
        array
            .put_between(Value::from("b"), Value::Int(1), &first, &second)
            .unwrap();
        assert_eq!(
            array.read(),
            vec![Value::from("a"), Value::from("b"), Value::from("c")]
        );

        let first_uuid = array.read_full()[0].uuid.clone();
        array
            .put_before(Value::from("pre"), Value::Int(1), &first_uuid)
            .unwrap();
        let last_uuid = array.read_full().last().unwrap().uuid.clone();
        array
            .put_after(Value::from("post"), Value::Int(1), &last_uuid)
            .unwrap();
        assert_eq!(
            array.read(),
            vec![
                Value::from("pre"),
                Value::from("a"),
                Value::from("b"),
                Value::from("c"),
                Value::from("post"),
            ]
        );

        let err = array
            .put_before(Value::from("x"), Value::Int(1), b"no such uuid")
            .unwrap_err();
        assert!(matches!(err, CrdtError::MissingItem { .. }));
    }

    #[test]
    fn concurrent_neighbors_of_one_anchor_interleave_identically() {
        let mut a = FiArray::new();
        a.put_first(Value::from("first"), Value::Int(1)).unwrap();
        a.put_last(Value::from("last"), Value::Int(1)).unwrap();

        let mut b = replica_of(&a);
        for delta in a.history(None, None) {
            b.update(&delta).unwrap();
        }

        let last_uuid = a.read_full()[1].uuid.clone();
        let from_a = a
            .put_after(Value::from("A"), Value::Int(1), &last_uuid)
            .unwrap();
        let from_b = b
            .put_before(Value::from("B"), Value::Int(2), &last_uuid)
            .unwrap();

        a.update(&from_b).unwrap();
        b.update(&from_a).unwrap();

        let expected = vec![
            Value::from("first"),
            Value::from("B"),
            Value::from("last"),
            Value::from("A"),
        ];
        assert_eq!(a.read(), expected);
        assert_eq!(b.read(), expected);
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn concurrent_vector_stamp_inserts_converge() {
        let uuid = ClockUuid::generate();
        let members = NonZeroUsize::new(2).unwrap();
        let mut a = FiArray::with_clock(VectorClock::new(uuid.clone(), members, 0));
        let mut b = FiArray::with_clock(VectorClock::new(uuid, members, 1));

        // Both replicas insert into the same empty slot concurrently; the
        // jittered indices (uuid tie-break at worst) order them identically
        // on both sides.
        let from_a = a.put_first(Value::from("A"), Value::Int(1)).unwrap();
        let from_b = b.put_first(Value::from("B"), Value::Int(2)).unwrap();
        assert!(VectorClock::are_concurrent(from_a.ts(), from_b.ts()));

        a.update(&from_b).unwrap();
        b.update(&from_a).unwrap();

        assert_eq!(a.list_len(), 2);
        assert_eq!(a.read(), b.read());
        assert_eq!(a.read_full(), b.read_full());
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn move_item_by_index_before_and_after() {
        let mut array = FiArray::new();
        array.put(Value::from("a"), Value::Int(1), decimal("0.2")).unwrap();
        array.put(Value::from("b"), Value::Int(1), decimal("0.4")).unwrap();
        array.put(Value::from("c"), Value::Int(1), decimal("0.6")).unwrap();

        let c_uuid = array.read_full()[2].uuid.clone();
        array
            .move_item(&c_uuid, MoveTarget::Index(decimal("0.1")), Value::Int(1))
            .unwrap();
        assert_eq!(
            array.read(),
            vec![Value::from("c"), Value::from("a"), Value::from("b")]
        );

        let a_uuid = array.read_full()[1].uuid.clone();
        let b_uuid = array.read_full()[2].uuid.clone();
        array
            .move_item(&a_uuid, MoveTarget::After(b_uuid.clone()), Value::Int(1))
            .unwrap();
        assert_eq!(
            array.read(),
            vec![Value::from("c"), Value::from("b"), Value::from("a")]
        );

        array
            .move_item(&a_uuid, MoveTarget::Before(c_uuid), Value::Int(1))
            .unwrap();
        assert_eq!(
            array.read(),
            vec![Value::from("a"), Value::from("c"), Value::from("b")]
        );

        let err = array
            .move_item(b"unknown", MoveTarget::Index(decimal("0.5")), Value::Int(1))
            .unwrap_err();
        assert!(matches!(err, CrdtError::MissingItem { .. }));
    }

    #[test]
    fn concurrent_moves_converge_through_the_map() {
        let mut a = FiArray::new();
        a.put(Value::from("x"), Value::Int(1), decimal("0.5")).unwrap();
        a.put(Value::from("y"), Value::Int(1), decimal("0.7")).unwrap();

        let mut b = replica_of(&a);
        for delta in a.history(None, None) {
            b.update(&delta).unwrap();
        }

        let x_uuid = a.read_full()[0].uuid.clone();
        let from_a = a
            .move_item(&x_uuid, MoveTarget::Index(decimal("0.1")), Value::Int(1))
            .unwrap();
        let from_b = b
            .move_item(&x_uuid, MoveTarget::Index(decimal("0.9")), Value::Int(2))
            .unwrap();

        a.update(&from_b).unwrap();
        b.update(&from_a).unwrap();

        // Same stamp, writer 2 wins on both replicas.
        assert_eq!(a.read(), vec![Value::from("y"), Value::from("x")]);
        assert_eq!(b.read(), a.read());
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn delete_and_remove_at() {
        let mut array = FiArray::new();
        array.put(Value::from("a"), Value::Int(1), decimal("0.2")).unwrap();
        array.put(Value::from("b"), Value::Int(1), decimal("0.4")).unwrap();

        array.remove_at(0, &Value::Int(1)).unwrap();
        assert_eq!(array.read(), vec![Value::from("b")]);

        let err = array.remove_at(7, &Value::Int(1)).unwrap_err();
        assert!(matches!(err, CrdtError::OutOfBounds { index: 7, len: 1 }));

        // Deleting an unknown uuid is a preemptive tombstone, not an error.
        array.delete(b"never seen", Value::Int(1)).unwrap();
        assert_eq!(array.read(), vec![Value::from("b")]);
    }

    #[test]
    fn normalize_redistributes_evenly() {
        let mut array = FiArray::new();
        for i in 0..4 {
            array.append(Value::Int(i), Value::Int(1)).unwrap();
        }
        let before = array.read();

        let updates = array.normalize(BigDecimal::one(), Value::Int(1)).unwrap();
        assert_eq!(updates.len(), 4);
        assert_eq!(array.read(), before);

        let full = array.read_full();
        assert_eq!(full[0].index, decimal("0.2"));
        assert_eq!(full[1].index, decimal("0.4"));
        assert_eq!(full[2].index, decimal("0.6"));
        assert_eq!(full[3].index, decimal("0.8"));

        // The emitted updates bring a replica to the same order.
        let mut replica = replica_of(&array);
        for delta in array.history(None, None) {
            replica.update(&delta).unwrap();
        }
        assert_eq!(replica.read(), array.read());
    }

    #[test]
    fn deltas_commute_and_are_idempotent() {
        let mut source = FiArray::new();
        let mut deltas = vec![
            source.put(Value::from("a"), Value::Int(1), decimal("0.3")).unwrap(),
            source.put(Value::from("b"), Value::Int(1), decimal("0.6")).unwrap(),
        ];
        let b_uuid = source.read_full()[1].uuid.clone();
        deltas.push(
            source
                .move_item(&b_uuid, MoveTarget::Index(decimal("0.1")), Value::Int(1))
                .unwrap(),
        );
        deltas.push(source.delete(&b_uuid, Value::Int(1)).unwrap());

        let mut previous: Option<FiArray> = None;
        for perm in deltas.iter().permutations(deltas.len()) {
            let mut replica = replica_of(&source);
            for delta in perm {
                replica.update(delta).unwrap();
                replica.update(delta).unwrap();
            }
            assert_eq!(replica.read(), vec![Value::from("a")]);
            if let Some(ref previous) = previous {
                assert_eq!(previous.pack(), replica.pack());
            }
            previous = Some(replica);
        }
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let mut array = FiArray::new();
        let delta = StateUpdate::new(
            array.clock_uuid().clone(),
            1,
            LwwMapDelta {
                op: MapOp::Set,
                key: Value::from("not bytes"),
                value: FiaItem {
                    value: Value::Int(1),
                    index: decimal("0.5"),
                    uuid: vec![1],
                }
                .encode(),
                writer: Value::Int(1),
            },
        );
        assert!(matches!(
            array.update(&delta).unwrap_err(),
            CrdtError::WrongType { .. }
        ));

        let delta = StateUpdate::new(
            array.clock_uuid().clone(),
            1,
            LwwMapDelta {
                op: MapOp::Set,
                key: Value::Bytes(vec![9, 9]),
                value: FiaItem {
                    value: Value::Int(1),
                    index: decimal("0.5"),
                    uuid: vec![1],
                }
                .encode(),
                writer: Value::Int(1),
            },
        );
        assert!(matches!(
            array.update(&delta).unwrap_err(),
            CrdtError::InvalidValue { .. }
        ));
        assert!(array.read().is_empty());
    }

    #[test]
    fn history_replay_and_pack_roundtrip() {
        let mut array = FiArray::new();
        array.put_first(Value::from("a"), Value::Int(1)).unwrap();
        array.put_last(Value::from("b"), Value::Int(1)).unwrap();
        array.append(Value::from("c"), Value::Int(1)).unwrap();
        array.remove_at(1, &Value::Int(1)).unwrap();

        let mut replica = replica_of(&array);
        for delta in array.history(None, None) {
            replica.update(&delta).unwrap();
        }
        assert_eq!(replica.read(), array.read());
        assert_eq!(replica.checksums(None, None), array.checksums(None, None));

        let back = FiArray::unpack(&array.pack(), &Inject::EMPTY).unwrap();
        assert_eq!(back, array);
        assert_eq!(back.read(), array.read());
        assert_eq!(back.read_full(), array.read_full());
    }
}
