//! Delta-set summaries for reconciliation.
//!
//! Two replicas decide whether (and what) to exchange without shipping full
//! state: [[Checksums]] answers "are we equal over this range" in O(1)
//! message size, and [[MerkleHistory]] content-addresses every delta so the
//! missing subset can be requested directly.

use crate::codec::{self, ByteReader, CodecError, DigestLengthSnafu, Packable};
use crate::errors::{InvalidValueSnafu, Result};
use crate::value::Inject;
use sha2::{Digest as Sha2Digest, Sha256};
use snafu::prelude::*;
use std::{collections::BTreeMap, fmt};

/// Order-independent summary of a delta set.
///
/// `count` is the number of deltas, `total` the wrapping sum of each packed
/// delta's crc32 (order-independent by construction), and `crc` the crc32
/// over the sorted packed deltas. Equal checksums over the same range imply
/// identical delta sets with overwhelming probability.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Checksums {
    pub count: u64,
    pub total: u64,
    pub crc: u32,
}
impl Packable for Checksums {
    fn pack_into(&self, out: &mut Vec<u8>) {
        codec::put_u64(out, self.count);
        codec::put_u64(out, self.total);
        codec::put_u32(out, self.crc);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, _inject: &Inject) -> Result<Self, CodecError> {
        Ok(Self {
            count: reader.u64()?,
            total: reader.u64()?,
            crc: reader.u32()?,
        })
    }
}

pub fn checksums_over(packed: impl IntoIterator<Item = Vec<u8>>) -> Checksums {
    let mut deltas: Vec<Vec<u8>> = packed.into_iter().collect();
    deltas.sort_unstable();

    let mut total = 0u64;
    let mut hasher = crc32fast::Hasher::new();
    for delta in &deltas {
        total = total.wrapping_add(u64::from(crc32fast::hash(delta)));
        hasher.update(delta);
    }
    Checksums {
        count: deltas.len() as u64,
        total,
        crc: hasher.finalize(),
    }
}

/// A sha-256 content address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; 32]);
impl Digest {
    pub const LEN: usize = 32;

    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let array: [u8; Self::LEN] = bytes.try_into().ok().context(DigestLengthSnafu {
            expected: Self::LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}
impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}
impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
impl Packable for Digest {
    fn pack_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, _inject: &Inject) -> Result<Self, CodecError> {
        let bytes = reader.take(Self::LEN)?;
        Self::from_slice(bytes)
    }
}

/// The content-addressed form of a delta set.
///
/// Each leaf id is the sha-256 of one packed delta; the root is the sha-256
/// of the sorted leaf concatenation. Equal roots mean equal delta sets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleHistory {
    root: Digest,
    leaves: Vec<Digest>,
    deltas: BTreeMap<Digest, Vec<u8>>,
}
impl MerkleHistory {
    pub fn over(packed: impl IntoIterator<Item = Vec<u8>>) -> Self {
        let deltas: BTreeMap<Digest, Vec<u8>> = packed
            .into_iter()
            .map(|delta| (Digest::of(&delta), delta))
            .collect();
        let leaves: Vec<Digest> = deltas.keys().copied().collect();
        let root = root_over(&leaves);
        Self {
            root,
            leaves,
            deltas,
        }
    }

    pub const fn root(&self) -> &Digest {
        &self.root
    }

    /// Leaf ids in sorted order.
    pub fn leaves(&self) -> &[Digest] {
        &self.leaves
    }

    pub fn delta(&self, id: &Digest) -> Option<&[u8]> {
        self.deltas.get(id).map(Vec::as_slice)
    }

    pub fn iter_deltas(&self) -> impl Iterator<Item = (&Digest, &[u8])> {
        self.deltas.iter().map(|(id, delta)| (id, delta.as_slice()))
    }

    /// The subset of `peer_leaves` this side does not hold.
    ///
    /// Returns nothing when the roots already agree.
    pub fn missing_leaves(&self, peer_root: &Digest, peer_leaves: &[Digest]) -> Vec<Digest> {
        if peer_root == &self.root {
            return Vec::new();
        }
        let missing: Vec<Digest> = peer_leaves
            .iter()
            .filter(|leaf| !self.deltas.contains_key(leaf))
            .copied()
            .collect();
        log::debug!(
            "Merkle diff: {} of {} peer leaves missing locally",
            missing.len(),
            peer_leaves.len()
        );
        missing
    }

    /// Check internal consistency of a history received from a peer.
    ///
    /// Every leaf must address its delta and the root must cover exactly the
    /// leaves.
    pub fn verify(&self) -> Result<()> {
        ensure!(
            self.leaves.len() == self.deltas.len()
                && self.leaves.iter().all(|leaf| self.deltas.contains_key(leaf)),
            InvalidValueSnafu {
                what: "merkle history",
                reason: "leaf ids and packed deltas do not match".to_string(),
            }
        );
        for (id, delta) in &self.deltas {
            ensure!(
                &Digest::of(delta) == id,
                InvalidValueSnafu {
                    what: "merkle history",
                    reason: format!("leaf {id} does not address its delta"),
                }
            );
        }
        ensure!(
            root_over(&self.leaves) == self.root,
            InvalidValueSnafu {
                what: "merkle history",
                reason: "root does not cover the leaves".to_string(),
            }
        );
        Ok(())
    }
}
impl Packable for MerkleHistory {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.root.pack_into(out);
        codec::put_len(out, self.deltas.len());
        for delta in self.deltas.values() {
            codec::put_byte_seq(out, delta);
        }
    }

    fn unpack_from(reader: &mut ByteReader<'_>, _inject: &Inject) -> Result<Self, CodecError> {
        let root = Digest::unpack_from(reader, &Inject::EMPTY)?;
        let count = reader.u32()? as usize;
        let mut deltas = BTreeMap::new();
        for _ in 0..count {
            let delta = reader.byte_seq()?.to_vec();
            deltas.insert(Digest::of(&delta), delta);
        }
        let leaves: Vec<Digest> = deltas.keys().copied().collect();
        Ok(Self {
            root,
            leaves,
            deltas,
        })
    }
}

fn root_over(sorted_leaves: &[Digest]) -> Digest {
    let mut hasher = Sha256::new();
    for leaf in sorted_leaves {
        hasher.update(leaf.as_bytes());
    }
    Digest(hasher.finalize().into())
}
