//! Canonical byte encoding.
//!
//! Every encodable type produces exactly one byte sequence for a given
//! logical value, on every replica. Checksums and Merkle roots compare these
//! bytes directly, so the encoding must never depend on platform, map
//! iteration order, or library version quirks.
//!
//! Layout conventions:
//! - lengths and element counts are u32 big-endian,
//! - integers are 8 bytes big-endian with the sign bit flipped, so that the
//!   lexicographic byte order equals the numeric order,
//! - floats are IEEE-754 bits with the total-order transform applied (and
//!   NaN canonicalized), for the same reason,
//! - decimals are normalized plain text.

use crate::value::Inject;
use deltasync_utils::IString;
use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CodecError {
    #[snafu(display("Ran out of bytes: needed {needed} more, but only {remaining} left"))]
    Truncated { needed: usize, remaining: usize },
    #[snafu(display("{remaining} trailing bytes after the end of the encoded value"))]
    Trailing { remaining: usize },
    #[snafu(display("Unknown encoding tag {tag:#04x} for {what}"))]
    UnknownTag { tag: u8, what: &'static str },
    #[snafu(display("Encoded string is not valid UTF-8"))]
    Utf8 { source: std::string::FromUtf8Error },
    #[snafu(display("Invalid canonical decimal text {text:?}"))]
    DecimalText { text: String },
    #[snafu(display("Custom type {tag} was rejected by its factory: {reason}"))]
    CustomRejected { tag: IString, reason: String },
    #[snafu(display("Digest must be {expected} bytes, but got {actual}"))]
    DigestLength { expected: usize, actual: usize },
    #[snafu(display("Decoded state is inconsistent: {reason}"))]
    Inconsistent { reason: String },
}

/// Types with a canonical byte representation.
///
/// `unpack_from` consumes exactly the bytes `pack_into` produced; [[Packable::unpack]]
/// additionally rejects trailing garbage.
pub trait Packable: Sized {
    fn pack_into(&self, out: &mut Vec<u8>);

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError>;

    fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.pack_into(&mut out);
        out
    }

    fn unpack(bytes: &[u8], inject: &Inject) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let value = Self::unpack_from(&mut reader, inject)?;
        reader.expect_end()?;
        Ok(value)
    }
}

/// A cursor over an encoded byte slice.
#[derive(Clone, Debug)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
}
impl<'a> ByteReader<'a> {
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub const fn remaining(&self) -> usize {
        self.bytes.len()
    }

    pub fn expect_end(&self) -> Result<(), CodecError> {
        ensure!(
            self.bytes.is_empty(),
            TrailingSnafu {
                remaining: self.bytes.len()
            }
        );
        Ok(())
    }

    pub fn take(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        ensure!(
            count <= self.bytes.len(),
            TruncatedSnafu {
                needed: count - self.bytes.len(),
                remaining: self.bytes.len(),
            }
        );
        let (head, rest) = self.bytes.split_at(count);
        self.bytes = rest;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4 bytes")))
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub fn i64(&mut self) -> Result<i64, CodecError> {
        Ok((self.u64()? ^ SIGN_BIT) as i64)
    }

    pub fn f64(&mut self) -> Result<f64, CodecError> {
        let ordered = self.u64()?;
        let bits = if ordered & SIGN_BIT != 0 {
            ordered ^ SIGN_BIT
        } else {
            !ordered
        };
        Ok(f64::from_bits(bits))
    }

    /// Read a u32-length-prefixed byte sequence.
    pub fn byte_seq(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// Read a u32-length-prefixed UTF-8 string.
    pub fn str_seq(&mut self) -> Result<String, CodecError> {
        let bytes = self.byte_seq()?;
        String::from_utf8(bytes.to_vec()).context(Utf8Snafu)
    }
}

const SIGN_BIT: u64 = 1 << 63;

pub fn put_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn put_i64(out: &mut Vec<u8>, value: i64) {
    put_u64(out, (value as u64) ^ SIGN_BIT);
}

/// Write float bits so that the byte order is a total order agreeing with
/// the numeric order on non-NaN values. All NaNs collapse to one canonical
/// encoding.
pub fn put_f64(out: &mut Vec<u8>, value: f64) {
    let bits = if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    };
    let ordered = if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits | SIGN_BIT
    };
    put_u64(out, ordered);
}

pub fn put_len(out: &mut Vec<u8>, len: usize) {
    let len = u32::try_from(len).expect("Sequence length exceeds the wire format limit");
    put_u32(out, len);
}

pub fn put_byte_seq(out: &mut Vec<u8>, bytes: &[u8]) {
    put_len(out, bytes.len());
    out.extend_from_slice(bytes);
}

pub fn put_str_seq(out: &mut Vec<u8>, s: &str) {
    put_byte_seq(out, s.as_bytes());
}

impl Packable for u64 {
    fn pack_into(&self, out: &mut Vec<u8>) {
        put_u64(out, *self);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, _inject: &Inject) -> Result<Self, CodecError> {
        reader.u64()
    }
}
