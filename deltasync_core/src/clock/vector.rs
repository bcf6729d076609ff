use super::{CausalOrdering, Clock, ClockUuid, OrderingAccumulator};
use crate::codec::{self, ByteReader, CodecError, Packable};
use crate::value::{Inject, Value};
use itertools::Itertools;
use std::{fmt, num::NonZeroUsize};

/// A fixed-membership vector clock.
///
/// Unlike [[super::LamportClock]] this produces genuinely concurrent stamps,
/// exercising the partial-order paths of every merge rule. The member set is
/// fixed at construction; each replica owns one position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VectorClock {
    uuid: ClockUuid,
    position: usize,
    entries: Box<[u64]>,
}
impl VectorClock {
    /// A fresh clock for the replica at `position` out of `num_members`.
    pub fn new(uuid: ClockUuid, num_members: NonZeroUsize, position: usize) -> Self {
        assert!(
            position < num_members.get(),
            "Position {position} is outside of the member range (0-{})",
            num_members.get() - 1
        );
        Self {
            uuid,
            position,
            entries: vec![0; num_members.get()].into_boxed_slice(),
        }
    }

    pub const fn num_members(&self) -> usize {
        self.entries.len()
    }

    pub const fn position(&self) -> usize {
        self.position
    }
}
impl Clock for VectorClock {
    type Timestamp = VectorStamp;

    fn uuid(&self) -> &ClockUuid {
        &self.uuid
    }

    fn read(&self) -> VectorStamp {
        VectorStamp(self.entries.clone())
    }

    fn update(&mut self, other: &VectorStamp) -> VectorStamp {
        if !other.is_bottom() {
            assert_eq!(
                other.0.len(),
                self.entries.len(),
                "Stamp from a different member set"
            );
            for (own, foreign) in self.entries.iter_mut().zip(other.0.iter()) {
                *own = (*own).max(*foreign);
            }
        }
        self.entries[self.position] = self.entries[self.position]
            .checked_add(1)
            .expect("Max timestamp reached");
        self.read()
    }

    fn absorb(&mut self, other: &VectorStamp) {
        if other.is_bottom() {
            return;
        }
        assert_eq!(
            other.0.len(),
            self.entries.len(),
            "Stamp from a different member set"
        );
        for (own, foreign) in self.entries.iter_mut().zip(other.0.iter()) {
            *own = (*own).max(*foreign);
        }
    }

    fn compare(a: &VectorStamp, b: &VectorStamp) -> CausalOrdering {
        match (a.is_bottom(), b.is_bottom()) {
            (true, true) => return CausalOrdering::Equal,
            (true, false) => return CausalOrdering::Before,
            (false, true) => return CausalOrdering::After,
            (false, false) => {}
        }
        if a.0.len() != b.0.len() {
            // Stamps from different member sets cannot be causally related.
            return CausalOrdering::Concurrent;
        }
        let mut orderings = OrderingAccumulator::none();
        for (own, foreign) in a.0.iter().zip(b.0.iter()) {
            orderings.observe(own.cmp(foreign));
            if orderings.is_mixed() {
                // We can stop checking early in this case.
                return CausalOrdering::Concurrent;
            }
        }
        orderings.finish()
    }

    fn default_ts() -> VectorStamp {
        VectorStamp::bottom()
    }

    fn wrap_ts(ts: &VectorStamp) -> Value {
        Value::List(
            ts.0.iter()
                .map(|entry| {
                    Value::Int(
                        i64::try_from(*entry).expect("Timestamp exceeds the Value integer range"),
                    )
                })
                .collect(),
        )
    }
}
impl Packable for VectorClock {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.uuid.pack_into(out);
        codec::put_len(out, self.position);
        codec::put_len(out, self.entries.len());
        for entry in &self.entries {
            codec::put_u64(out, *entry);
        }
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let uuid = ClockUuid::unpack_from(reader, inject)?;
        let position = reader.u32()? as usize;
        let count = reader.u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            entries.push(reader.u64()?);
        }
        Ok(Self {
            uuid,
            position,
            entries: entries.into_boxed_slice(),
        })
    }
}

/// One position per member; the empty stamp is the bottom element and
/// compares before every non-empty stamp.
///
/// The derived `Ord` is lexicographic, which is a linear extension of the
/// causal order: pointwise dominance implies lexicographic dominance.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VectorStamp(Box<[u64]>);
impl VectorStamp {
    pub fn bottom() -> Self {
        Self(Box::from([]))
    }

    pub const fn is_bottom(&self) -> bool {
        self.0.is_empty()
    }
}
impl<const N: usize> From<[u64; N]> for VectorStamp {
    fn from(entries: [u64; N]) -> Self {
        Self(Box::from(entries))
    }
}
impl fmt::Debug for VectorStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "〈{}〉", self.0.iter().join(", "))
    }
}
impl Packable for VectorStamp {
    fn pack_into(&self, out: &mut Vec<u8>) {
        codec::put_len(out, self.0.len());
        for entry in &self.0 {
            codec::put_u64(out, *entry);
        }
    }

    fn unpack_from(reader: &mut ByteReader<'_>, _inject: &Inject) -> Result<Self, CodecError> {
        let count = reader.u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            entries.push(reader.u64()?);
        }
        Ok(Self(entries.into_boxed_slice()))
    }
}
