use super::LwwMapState;
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
    errors::ListenerRejectedSnafu,
    value::Inject,
};
use snafu::prelude::*;

/// The two operation classes of a map.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MapOp {
    Set,
    Unset,
}
impl Packable for MapOp {
    fn pack_into(&self, out: &mut Vec<u8>) {
        codec::put_u8(
            out,
            match self {
                MapOp::Set => 0,
                MapOp::Unset => 1,
            },
        );
    }

    fn unpack_from(reader: &mut ByteReader<'_>, _inject: &Inject) -> Result<Self, CodecError> {
        match reader.u8()? {
            0 => Ok(MapOp::Set),
            1 => Ok(MapOp::Unset),
            tag => UnknownTagSnafu {
                tag,
                what: "map operation",
            }
            .fail(),
        }
    }
}

/// Payload of one map write.
///
/// `value` is the none sentinel exactly for unset operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LwwMapDelta {
    pub op: MapOp,
    pub key: Value,
    pub value: Value,
    pub writer: Value,
}
impl Packable for LwwMapDelta {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.op.pack_into(out);
        self.key.pack_into(out);
        self.value.pack_into(out);
        self.writer.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            op: MapOp::unpack_from(reader, inject)?,
            key: Value::unpack_from(reader, inject)?,
            value: Value::unpack_from(reader, inject)?,
            writer: Value::unpack_from(reader, inject)?,
        })
    }
}

/// A last-writer-wins map: an observed-remove set of keys with one
/// [[super::LwwRegister]]-style slot per key.
///
/// `read` emits only keys present in the key-set view whose slot holds a
/// real value.
#[derive(Clone, Debug, PartialEq)]
pub struct LwwMap<C: Clock = LamportClock> {
    clock: C,
    state: LwwMapState<C>,
    listeners: Listeners<StateUpdate<LwwMapDelta, C::Timestamp>>,
}
impl LwwMap<LamportClock> {
    pub fn new() -> Self {
        Self::with_clock(LamportClock::new())
    }
}
impl Default for LwwMap<LamportClock> {
    fn default() -> Self {
        Self::new()
    }
}
impl<C: Clock> LwwMap<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: LwwMapState::new(),
            listeners: Listeners::new(),
        }
    }

    pub fn set(
        &mut self,
        key: Value,
        value: Value,
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        self.emit(LwwMapDelta {
            op: MapOp::Set,
            key,
            value,
            writer,
        })
    }

    pub fn unset(
        &mut self,
        key: Value,
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        self.emit(LwwMapDelta {
            op: MapOp::Unset,
            key,
            value: Value::None,
            writer,
        })
    }

    fn emit(&mut self, data: LwwMapDelta) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        LwwMapState::<C>::validate(&data)?;
        let ts = self.clock.tick();
        let delta = StateUpdate::new(self.clock.uuid().clone(), ts, data);
        self.update(&delta)?;
        Ok(delta)
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.state.visible_value(key).cloned()
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.state.visible_value(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.iter_visible().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// History restricted to one operation class.
    pub fn history_filtered(
        &self,
        op: Option<MapOp>,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<LwwMapDelta, C::Timestamp>> {
        self.state
            .history_deltas(self.clock.uuid(), op, from, until)
    }
}
impl<C: Clock> DeltaCrdt for LwwMap<C> {
    type Clock = C;
    type Payload = LwwMapDelta;
    type View = Vec<(Value, Value)>;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&self) -> Vec<(Value, Value)> {
        self.state
            .iter_visible()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn update(&mut self, delta: &StateUpdate<LwwMapDelta, C::Timestamp>) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        LwwMapState::<C>::validate(delta.data())?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());
        self.state.apply(delta.data(), delta.ts());
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<LwwMapDelta, C::Timestamp>> {
        self.history_filtered(None, from, until)
    }

    fn listeners(&self) -> &Listeners<StateUpdate<LwwMapDelta, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(&mut self) -> &mut Listeners<StateUpdate<LwwMapDelta, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> Packable for LwwMap<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        self.state.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let state = LwwMapState::unpack_from(reader, inject)?;
        Ok(Self {
            clock,
            state,
            listeners: Listeners::new(),
        })
    }
}
