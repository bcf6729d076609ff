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
use std::collections::BTreeMap;

/// Payload of one set addition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GSetDelta {
    pub member: Value,
}
impl Packable for GSetDelta {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.member.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            member: Value::unpack_from(reader, inject)?,
        })
    }
}

/// A grow-only set.
///
/// Convergence is plain set union; per member the earliest observation stamp
/// is retained so history ranges can be filtered.
#[derive(Clone, Debug, PartialEq)]
pub struct GSet<C: Clock = LamportClock> {
    clock: C,
    members: BTreeMap<Value, C::Timestamp>,
    listeners: Listeners<StateUpdate<GSetDelta, C::Timestamp>>,
}
impl GSet<LamportClock> {
    pub fn new() -> Self {
        Self::with_clock(LamportClock::new())
    }
}
impl Default for GSet<LamportClock> {
    fn default() -> Self {
        Self::new()
    }
}
impl<C: Clock> GSet<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            members: BTreeMap::new(),
            listeners: Listeners::new(),
        }
    }

    /// Add `member` and return the update for propagation.
    ///
    /// Adding an existing member re-emits its original delta instead of
    /// minting a new stamp.
    pub fn add(&mut self, member: Value) -> Result<StateUpdate<GSetDelta, C::Timestamp>> {
        let ts = match self.members.get(&member) {
            Some(existing) => existing.clone(),
            None => self.clock.tick(),
        };
        let delta = StateUpdate::new(self.clock.uuid().clone(), ts, GSetDelta { member });
        self.update(&delta)?;
        Ok(delta)
    }

    pub fn contains(&self, member: &Value) -> bool {
        self.members.contains_key(member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
impl<C: Clock> DeltaCrdt for GSet<C> {
    type Clock = C;
    type Payload = GSetDelta;
    type View = Vec<Value>;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&self) -> Vec<Value> {
        self.members.keys().cloned().collect()
    }

    fn update(&mut self, delta: &StateUpdate<GSetDelta, C::Timestamp>) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());
        match self.members.entry(delta.data().member.clone()) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(delta.ts().clone());
            }
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                // Keep the earliest observation.
                if delta.ts() < entry.get() {
                    entry.insert(delta.ts().clone());
                }
            }
        }
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<GSetDelta, C::Timestamp>> {
        self.members
            .iter()
            .filter(|(_, ts)| timestamp_in_range::<C>(ts, from, until))
            .map(|(member, ts)| {
                StateUpdate::new(
                    self.clock.uuid().clone(),
                    ts.clone(),
                    GSetDelta {
                        member: member.clone(),
                    },
                )
            })
            .collect()
    }

    fn listeners(&self) -> &Listeners<StateUpdate<GSetDelta, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(&mut self) -> &mut Listeners<StateUpdate<GSetDelta, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> Packable for GSet<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        codec::put_len(out, self.members.len());
        for (member, ts) in &self.members {
            member.pack_into(out);
            ts.pack_into(out);
        }
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let count = reader.u32()? as usize;
        let mut members = BTreeMap::new();
        for _ in 0..count {
            let member = Value::unpack_from(reader, inject)?;
            let ts = C::Timestamp::unpack_from(reader, inject)?;
            members.insert(member, ts);
        }
        Ok(Self {
            clock,
            members,
            listeners: Listeners::new(),
        })
    }
}
