use super::mv_absorb;
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
use std::collections::BTreeSet;

/// Payload of one multi-value register write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MvRegisterDelta {
    pub value: Value,
}
impl Packable for MvRegisterDelta {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.value.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            value: Value::unpack_from(reader, inject)?,
        })
    }
}

/// A multi-value register.
///
/// Instead of arbitrating, concurrent writes are all kept: the state is the
/// set of writes not dominated by any later write. A subsequent write that
/// dominates the whole set collapses it back to one value.
#[derive(Clone, Debug, PartialEq)]
pub struct MvRegister<C: Clock = LamportClock> {
    clock: C,
    name: Value,
    entries: BTreeSet<(C::Timestamp, Value)>,
    listeners: Listeners<StateUpdate<MvRegisterDelta, C::Timestamp>>,
}
impl MvRegister<LamportClock> {
    pub fn new(name: Value) -> Self {
        Self::with_clock(LamportClock::new(), name)
    }
}
impl<C: Clock> MvRegister<C> {
    pub fn with_clock(clock: C, name: Value) -> Self {
        Self {
            clock,
            name,
            entries: BTreeSet::new(),
            listeners: Listeners::new(),
        }
    }

    pub const fn name(&self) -> &Value {
        &self.name
    }

    /// The stamp of the latest surviving write, in storage order.
    pub fn last_update_ts(&self) -> C::Timestamp {
        self.entries
            .iter()
            .map(|(ts, _)| ts.clone())
            .max()
            .unwrap_or_else(C::default_ts)
    }

    pub fn write(&mut self, value: Value) -> Result<StateUpdate<MvRegisterDelta, C::Timestamp>> {
        let ts = self.clock.tick();
        let delta = StateUpdate::new(self.clock.uuid().clone(), ts, MvRegisterDelta { value });
        self.update(&delta)?;
        Ok(delta)
    }
}
impl<C: Clock> DeltaCrdt for MvRegister<C> {
    type Clock = C;
    type Payload = MvRegisterDelta;
    type View = Vec<Value>;

    /// The surviving values, sorted by serialized form and deduplicated.
    fn read(&self) -> Vec<Value> {
        let values: BTreeSet<&Value> = self.entries.iter().map(|(_, value)| value).collect();
        values.into_iter().cloned().collect()
    }

    fn clock(&self) -> &C {
        &self.clock
    }

    fn update(
        &mut self,
        delta: &StateUpdate<MvRegisterDelta, C::Timestamp>,
    ) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());
        mv_absorb::<C>(&mut self.entries, delta.ts(), &delta.data().value);
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<MvRegisterDelta, C::Timestamp>> {
        self.entries
            .iter()
            .filter(|(ts, _)| timestamp_in_range::<C>(ts, from, until))
            .map(|(ts, value)| {
                StateUpdate::new(
                    self.clock.uuid().clone(),
                    ts.clone(),
                    MvRegisterDelta {
                        value: value.clone(),
                    },
                )
            })
            .collect()
    }

    fn listeners(&self) -> &Listeners<StateUpdate<MvRegisterDelta, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(
        &mut self,
    ) -> &mut Listeners<StateUpdate<MvRegisterDelta, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> Packable for MvRegister<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        self.name.pack_into(out);
        codec::put_len(out, self.entries.len());
        for (ts, value) in &self.entries {
            ts.pack_into(out);
            value.pack_into(out);
        }
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let name = Value::unpack_from(reader, inject)?;
        let count = reader.u32()? as usize;
        let mut entries = BTreeSet::new();
        for _ in 0..count {
            let ts = C::Timestamp::unpack_from(reader, inject)?;
            let value = Value::unpack_from(reader, inject)?;
            entries.insert((ts, value));
        }
        Ok(Self {
            clock,
            name,
            entries,
            listeners: Listeners::new(),
        })
    }
}
