use crate::clock::ClockUuid;
use crate::codec::{ByteReader, CodecError, Packable};
use crate::value::Inject;

/// The delta envelope: one mutation, addressed to one data type instance.
///
/// Updates are immutable once created and compare structurally. Their
/// canonical byte form (via [[Packable]]) is the wire format, the checksum
/// input, and the Merkle leaf preimage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateUpdate<P, T> {
    clock_uuid: ClockUuid,
    ts: T,
    data: P,
}
impl<P, T> StateUpdate<P, T> {
    pub const fn new(clock_uuid: ClockUuid, ts: T, data: P) -> Self {
        Self {
            clock_uuid,
            ts,
            data,
        }
    }

    pub const fn clock_uuid(&self) -> &ClockUuid {
        &self.clock_uuid
    }

    pub const fn ts(&self) -> &T {
        &self.ts
    }

    pub const fn data(&self) -> &P {
        &self.data
    }
}
impl<P, T> Packable for StateUpdate<P, T>
where
    P: Packable,
    T: Packable,
{
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock_uuid.pack_into(out);
        self.ts.pack_into(out);
        self.data.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock_uuid = ClockUuid::unpack_from(reader, inject)?;
        let ts = T::unpack_from(reader, inject)?;
        let data = P::unpack_from(reader, inject)?;
        Ok(Self {
            clock_uuid,
            ts,
            data,
        })
    }
}
