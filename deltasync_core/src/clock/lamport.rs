use super::{CausalOrdering, Clock, ClockUuid};
use crate::codec::{self, ByteReader, CodecError, Packable};
use crate::value::{Inject, Value};

/// The default clock: a scalar Lamport counter.
///
/// Timestamps are totally ordered, so [[Clock::are_concurrent]] is always
/// `false`; concurrent writes surface as equal stamps and are resolved by
/// the per-type tie-break rules instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LamportClock {
    uuid: ClockUuid,
    counter: u64,
}
impl LamportClock {
    /// A fresh clock with a generated uuid, for the first replica of an
    /// instance.
    pub fn new() -> Self {
        Self {
            uuid: ClockUuid::generate(),
            counter: 0,
        }
    }

    /// A fresh clock adopting the uuid of an existing instance, for further
    /// replicas.
    pub fn with_uuid(uuid: ClockUuid) -> Self {
        Self { uuid, counter: 0 }
    }
}
impl Default for LamportClock {
    fn default() -> Self {
        Self::new()
    }
}
impl Clock for LamportClock {
    type Timestamp = u64;

    fn uuid(&self) -> &ClockUuid {
        &self.uuid
    }

    fn read(&self) -> u64 {
        self.counter
    }

    fn update(&mut self, other: &u64) -> u64 {
        self.counter = self
            .counter
            .max(*other)
            .checked_add(1)
            .expect("Max timestamp reached");
        self.counter
    }

    fn absorb(&mut self, other: &u64) {
        self.counter = self.counter.max(*other);
    }

    fn compare(a: &u64, b: &u64) -> CausalOrdering {
        a.cmp(b).into()
    }

    fn default_ts() -> u64 {
        0
    }

    fn wrap_ts(ts: &u64) -> Value {
        Value::Int(i64::try_from(*ts).expect("Timestamp exceeds the Value integer range"))
    }
}
impl Packable for LamportClock {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.uuid.pack_into(out);
        codec::put_u64(out, self.counter);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let uuid = ClockUuid::unpack_from(reader, inject)?;
        let counter = reader.u64()?;
        Ok(Self { uuid, counter })
    }
}
