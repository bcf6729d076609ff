//! Register and map data types.
//!
//! The last-writer-wins rule and the multi-value antichain are shared here;
//! [[LwwMapState]] is also the storage core of the ordered list types.

use crate::sets::OrSetState;
use deltasync_core::{
    CausalOrdering,
    Clock,
    Packable,
    Result,
    StateUpdate,
    Value,
    codec::{self, ByteReader, CodecError},
    errors::InvalidValueSnafu,
    timestamp_in_range,
};
use deltasync_core::{ClockUuid, value::Inject};
use snafu::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

mod lww_map;
mod lww_register;
mod mv_map;
mod mv_register;

pub use lww_map::{LwwMap, LwwMapDelta, MapOp};
pub use lww_register::{LwwRegister, LwwRegisterDelta};
pub use mv_map::{MvMap, MvMapDelta};
pub use mv_register::{MvRegister, MvRegisterDelta};

/// One accepted register write.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LwwSlot<C: Clock> {
    pub value: Value,
    pub ts: C::Timestamp,
    pub writer: Value,
}

/// The deterministic total order over writes:
/// later timestamp, then higher writer id, then higher serialized value.
///
/// Equal-stamp and concurrent writes fall through to the same tie-breaks,
/// so every replica picks the same winner from any delivery order.
pub(crate) fn lww_wins<C: Clock>(new: &LwwSlot<C>, current: &LwwSlot<C>) -> bool {
    match C::compare(&new.ts, &current.ts) {
        CausalOrdering::After => true,
        CausalOrdering::Before => false,
        CausalOrdering::Equal | CausalOrdering::Concurrent => {
            match new.writer.cmp(&current.writer) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => new.value > current.value,
            }
        }
    }
}

/// Fold one write into a multi-value antichain.
///
/// The surviving entries are exactly the writes not strictly dominated by
/// any other applied write, which is a pure function of the applied set.
pub(crate) fn mv_absorb<C: Clock>(
    entries: &mut BTreeSet<(C::Timestamp, Value)>,
    ts: &C::Timestamp,
    value: &Value,
) {
    let entry = (ts.clone(), value.clone());
    if entries.contains(&entry) {
        return;
    }
    if entries
        .iter()
        .any(|(existing_ts, _)| C::compare(ts, existing_ts) == CausalOrdering::Before)
    {
        return;
    }
    entries.retain(|(existing_ts, _)| C::compare(existing_ts, ts) != CausalOrdering::Before);
    entries.insert(entry);
}

/// Visibility of one map key before and after an apply, with the visible
/// item value on each side. Used by the list caches.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MapTransition {
    pub key: Value,
    pub was: Option<Value>,
    pub now: Option<Value>,
}

/// The clock-less core of [[LwwMap]]: an observed/removed key set plus one
/// last-writer-wins slot per key.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LwwMapState<C: Clock> {
    keys: OrSetState<Value, C>,
    slots: BTreeMap<Value, LwwSlot<C>>,
}
impl<C: Clock> LwwMapState<C> {
    pub(crate) fn new() -> Self {
        Self {
            keys: OrSetState::new(),
            slots: BTreeMap::new(),
        }
    }

    pub(crate) fn validate(data: &LwwMapDelta) -> Result<()> {
        let consistent = match data.op {
            MapOp::Set => !data.value.is_none(),
            MapOp::Unset => data.value.is_none(),
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

    pub(crate) fn apply(&mut self, data: &LwwMapDelta, ts: &C::Timestamp) -> MapTransition {
        let key = data.key.clone();
        let was = self.visible_value(&key).cloned();

        match data.op {
            MapOp::Set => self.keys.observe(key.clone(), ts.clone()),
            MapOp::Unset => self.keys.remove(key.clone(), ts.clone()),
        };

        let incoming = LwwSlot {
            value: data.value.clone(),
            ts: ts.clone(),
            writer: data.writer.clone(),
        };
        match self.slots.entry(key.clone()) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(incoming);
            }
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                if lww_wins::<C>(&incoming, entry.get()) {
                    entry.insert(incoming);
                }
            }
        }

        let now = self.visible_value(&key).cloned();
        MapTransition { key, was, now }
    }

    /// The visible value of `key`: present in the key set and not the none
    /// sentinel.
    pub(crate) fn visible_value(&self, key: &Value) -> Option<&Value> {
        if !self.keys.is_visible(key) {
            return None;
        }
        self.slots
            .get(key)
            .map(|slot| &slot.value)
            .filter(|value| !value.is_none())
    }

    pub(crate) fn iter_visible(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.slots.iter().filter_map(|(key, slot)| {
            if slot.value.is_none() || !self.keys.is_visible(key) {
                None
            } else {
                Some((key, &slot.value))
            }
        })
    }

    pub(crate) fn history_deltas(
        &self,
        clock_uuid: &ClockUuid,
        op: Option<MapOp>,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<LwwMapDelta, C::Timestamp>> {
        self.slots
            .iter()
            .filter_map(|(key, slot)| {
                let slot_op = if slot.value.is_none() {
                    MapOp::Unset
                } else {
                    MapOp::Set
                };
                if let Some(filter) = op {
                    if filter != slot_op {
                        return None;
                    }
                }
                if !timestamp_in_range::<C>(&slot.ts, from, until) {
                    return None;
                }
                Some(StateUpdate::new(
                    clock_uuid.clone(),
                    slot.ts.clone(),
                    LwwMapDelta {
                        op: slot_op,
                        key: key.clone(),
                        value: slot.value.clone(),
                        writer: slot.writer.clone(),
                    },
                ))
            })
            .collect()
    }

    pub(crate) fn pack_into(&self, out: &mut Vec<u8>) {
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
        for (key, slot) in &self.slots {
            key.pack_into(out);
            slot.value.pack_into(out);
            slot.ts.pack_into(out);
            slot.writer.pack_into(out);
        }
    }

    pub(crate) fn unpack_from(
        reader: &mut ByteReader<'_>,
        inject: &Inject,
    ) -> Result<Self, CodecError> {
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
        let mut slots = BTreeMap::new();
        for _ in 0..slot_count {
            let key = Value::unpack_from(reader, inject)?;
            let value = Value::unpack_from(reader, inject)?;
            let ts = C::Timestamp::unpack_from(reader, inject)?;
            let writer = Value::unpack_from(reader, inject)?;
            slots.insert(key, LwwSlot { value, ts, writer });
        }
        Ok(Self { keys, slots })
    }
}
