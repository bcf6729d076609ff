use super::OrSetState;
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
    timestamp_in_range,
    value::Inject,
};
use snafu::prelude::*;

/// The two operation classes of an observed-remove set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetOp {
    Observe,
    Remove,
}
impl Packable for SetOp {
    fn pack_into(&self, out: &mut Vec<u8>) {
        codec::put_u8(
            out,
            match self {
                SetOp::Observe => 0,
                SetOp::Remove => 1,
            },
        );
    }

    fn unpack_from(reader: &mut ByteReader<'_>, _inject: &Inject) -> Result<Self, CodecError> {
        match reader.u8()? {
            0 => Ok(SetOp::Observe),
            1 => Ok(SetOp::Remove),
            tag => UnknownTagSnafu {
                tag,
                what: "set operation",
            }
            .fail(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrSetDelta {
    pub op: SetOp,
    pub member: Value,
}
impl Packable for OrSetDelta {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.op.pack_into(out);
        self.member.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            op: SetOp::unpack_from(reader, inject)?,
            member: Value::unpack_from(reader, inject)?,
        })
    }
}

/// An observed-remove set.
///
/// A member is present when its latest observe stamp is not dominated by its
/// latest remove stamp; equal or concurrent stamps keep the member
/// (add-biased). Removing a member that was never observed is permitted and
/// suppresses observes up to that stamp.
#[derive(Clone, Debug, PartialEq)]
pub struct OrSet<C: Clock = LamportClock> {
    clock: C,
    state: OrSetState<Value, C>,
    listeners: Listeners<StateUpdate<OrSetDelta, C::Timestamp>>,
}
impl OrSet<LamportClock> {
    pub fn new() -> Self {
        Self::with_clock(LamportClock::new())
    }
}
impl Default for OrSet<LamportClock> {
    fn default() -> Self {
        Self::new()
    }
}
impl<C: Clock> OrSet<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: OrSetState::new(),
            listeners: Listeners::new(),
        }
    }

    pub fn observe(&mut self, member: Value) -> Result<StateUpdate<OrSetDelta, C::Timestamp>> {
        self.emit(SetOp::Observe, member)
    }

    pub fn remove(&mut self, member: Value) -> Result<StateUpdate<OrSetDelta, C::Timestamp>> {
        self.emit(SetOp::Remove, member)
    }

    fn emit(
        &mut self,
        op: SetOp,
        member: Value,
    ) -> Result<StateUpdate<OrSetDelta, C::Timestamp>> {
        let ts = self.clock.tick();
        let delta = StateUpdate::new(self.clock.uuid().clone(), ts, OrSetDelta { op, member });
        self.update(&delta)?;
        Ok(delta)
    }

    pub fn contains(&self, member: &Value) -> bool {
        self.state.is_visible(member)
    }

    /// History restricted to one operation class.
    pub fn history_filtered(
        &self,
        op: Option<SetOp>,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<OrSetDelta, C::Timestamp>> {
        let mut deltas = Vec::new();
        if op.is_none() || op == Some(SetOp::Observe) {
            deltas.extend(
                self.state
                    .iter_observed()
                    .filter(|(_, ts)| timestamp_in_range::<C>(ts, from, until))
                    .map(|(member, ts)| {
                        StateUpdate::new(
                            self.clock.uuid().clone(),
                            ts.clone(),
                            OrSetDelta {
                                op: SetOp::Observe,
                                member: member.clone(),
                            },
                        )
                    }),
            );
        }
        if op.is_none() || op == Some(SetOp::Remove) {
            deltas.extend(
                self.state
                    .iter_removed()
                    .filter(|(_, ts)| timestamp_in_range::<C>(ts, from, until))
                    .map(|(member, ts)| {
                        StateUpdate::new(
                            self.clock.uuid().clone(),
                            ts.clone(),
                            OrSetDelta {
                                op: SetOp::Remove,
                                member: member.clone(),
                            },
                        )
                    }),
            );
        }
        deltas
    }
}
impl<C: Clock> DeltaCrdt for OrSet<C> {
    type Clock = C;
    type Payload = OrSetDelta;
    type View = Vec<Value>;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&self) -> Vec<Value> {
        self.state.iter_visible().cloned().collect()
    }

    fn update(&mut self, delta: &StateUpdate<OrSetDelta, C::Timestamp>) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());
        let member = delta.data().member.clone();
        match delta.data().op {
            SetOp::Observe => self.state.observe(member, delta.ts().clone()),
            SetOp::Remove => self.state.remove(member, delta.ts().clone()),
        };
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<OrSetDelta, C::Timestamp>> {
        self.history_filtered(None, from, until)
    }

    fn listeners(&self) -> &Listeners<StateUpdate<OrSetDelta, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(&mut self) -> &mut Listeners<StateUpdate<OrSetDelta, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> Packable for OrSet<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        codec::put_len(out, self.state.observed_len());
        for (member, ts) in self.state.iter_observed() {
            member.pack_into(out);
            ts.pack_into(out);
        }
        codec::put_len(out, self.state.removed_len());
        for (member, ts) in self.state.iter_removed() {
            member.pack_into(out);
            ts.pack_into(out);
        }
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let mut state = OrSetState::new();
        let observed_count = reader.u32()? as usize;
        for _ in 0..observed_count {
            let member = Value::unpack_from(reader, inject)?;
            let ts = C::Timestamp::unpack_from(reader, inject)?;
            state.insert_observed(member, ts);
        }
        let removed_count = reader.u32()? as usize;
        for _ in 0..removed_count {
            let member = Value::unpack_from(reader, inject)?;
            let ts = C::Timestamp::unpack_from(reader, inject)?;
            state.insert_removed(member, ts);
        }
        Ok(Self {
            clock,
            state,
            listeners: Listeners::new(),
        })
    }
}
