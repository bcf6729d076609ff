use super::{LwwSlot, lww_wins};
use deltasync_core::{
    Clock,
    DeltaCrdt,
    LamportClock,
    Listeners,
    Packable,
    Result,
    StateUpdate,
    Value,
    codec::{ByteReader, CodecError},
    errors::ListenerRejectedSnafu,
    timestamp_in_range,
    value::Inject,
};
use snafu::prelude::*;

/// Payload of one register write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LwwRegisterDelta {
    pub writer: Value,
    pub value: Value,
}
impl Packable for LwwRegisterDelta {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.writer.pack_into(out);
        self.value.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            writer: Value::unpack_from(reader, inject)?,
            value: Value::unpack_from(reader, inject)?,
        })
    }
}

/// A last-writer-wins register.
///
/// Concurrent writes resolve through the total order of
/// [[super::lww_wins]]: timestamp, then writer id, then serialized value.
#[derive(Clone, Debug, PartialEq)]
pub struct LwwRegister<C: Clock = LamportClock> {
    clock: C,
    name: Value,
    slot: LwwSlot<C>,
    listeners: Listeners<StateUpdate<LwwRegisterDelta, C::Timestamp>>,
}
impl LwwRegister<LamportClock> {
    pub fn new(name: Value) -> Self {
        Self::with_clock(LamportClock::new(), name)
    }
}
impl<C: Clock> LwwRegister<C> {
    pub fn with_clock(clock: C, name: Value) -> Self {
        Self {
            clock,
            name,
            slot: LwwSlot {
                value: Value::None,
                ts: C::default_ts(),
                writer: Value::None,
            },
            listeners: Listeners::new(),
        }
    }

    pub const fn name(&self) -> &Value {
        &self.name
    }

    pub const fn last_writer(&self) -> &Value {
        &self.slot.writer
    }

    pub const fn last_update_ts(&self) -> &C::Timestamp {
        &self.slot.ts
    }

    /// Overwrite the register, if the write wins, and return the update for
    /// propagation either way.
    pub fn write(
        &mut self,
        value: Value,
        writer: Value,
    ) -> Result<StateUpdate<LwwRegisterDelta, C::Timestamp>> {
        let ts = self.clock.tick();
        let delta = StateUpdate::new(
            self.clock.uuid().clone(),
            ts,
            LwwRegisterDelta { writer, value },
        );
        self.update(&delta)?;
        Ok(delta)
    }

    fn has_writes(&self) -> bool {
        self.slot.ts != C::default_ts()
            || !self.slot.value.is_none()
            || !self.slot.writer.is_none()
    }
}
impl<C: Clock> DeltaCrdt for LwwRegister<C> {
    type Clock = C;
    type Payload = LwwRegisterDelta;
    type View = Value;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&self) -> Value {
        self.slot.value.clone()
    }

    fn update(
        &mut self,
        delta: &StateUpdate<LwwRegisterDelta, C::Timestamp>,
    ) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());
        let incoming = LwwSlot {
            value: delta.data().value.clone(),
            ts: delta.ts().clone(),
            writer: delta.data().writer.clone(),
        };
        if !self.has_writes() || lww_wins::<C>(&incoming, &self.slot) {
            self.slot = incoming;
        }
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<LwwRegisterDelta, C::Timestamp>> {
        if !self.has_writes() || !timestamp_in_range::<C>(&self.slot.ts, from, until) {
            return Vec::new();
        }
        vec![StateUpdate::new(
            self.clock.uuid().clone(),
            self.slot.ts.clone(),
            LwwRegisterDelta {
                writer: self.slot.writer.clone(),
                value: self.slot.value.clone(),
            },
        )]
    }

    fn listeners(&self) -> &Listeners<StateUpdate<LwwRegisterDelta, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(
        &mut self,
    ) -> &mut Listeners<StateUpdate<LwwRegisterDelta, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> Packable for LwwRegister<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        self.name.pack_into(out);
        self.slot.value.pack_into(out);
        self.slot.ts.pack_into(out);
        self.slot.writer.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let name = Value::unpack_from(reader, inject)?;
        let value = Value::unpack_from(reader, inject)?;
        let ts = C::Timestamp::unpack_from(reader, inject)?;
        let writer = Value::unpack_from(reader, inject)?;
        Ok(Self {
            clock,
            name,
            slot: LwwSlot { value, ts, writer },
            listeners: Listeners::new(),
        })
    }
}
