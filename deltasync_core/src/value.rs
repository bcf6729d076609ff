//! The payload model.
//!
//! [[Value]] is the closed set of payload types every data type stores and
//! orders. A total order across *heterogeneous* values is required for
//! deterministic tie-breaks; it is defined as the lexicographic comparison
//! of `(type tag, canonical body bytes)`. Within one type the body encodings
//! are order-preserving where that is meaningful (integers, floats).
//!
//! User-defined types participate through the [[CustomValue]] contract and
//! travel as `(type_tag, bytes)` pairs. Decoding accepts an optional
//! [[Inject]] registry mapping type tags to factories, which validates and
//! resolves the foreign payloads it knows about.

use crate::codec::{
    self,
    ByteReader,
    CodecError,
    CustomRejectedSnafu,
    DecimalTextSnafu,
    Packable,
    UnknownTagSnafu,
};
use bigdecimal::BigDecimal;
use deltasync_utils::IString;
use num_bigint::Sign;
use ordered_float::OrderedFloat;
use snafu::prelude::*;
use std::{
    cmp,
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

/// A replicated payload value.
///
/// Equality, ordering, and hashing are all defined over the canonical
/// encoding, so two values are equal exactly when their bytes are.
#[derive(Clone, Debug)]
pub enum Value {
    /// The "no value" sentinel, used e.g. by map unset operations.
    None,
    Int(i64),
    Float(OrderedFloat<f64>),
    Decimal(BigDecimal),
    Str(String),
    Bytes(Vec<u8>),
    /// A heterogeneous sequence of values.
    List(Vec<Value>),
    /// A user-defined type, carried opaquely.
    Custom { tag: IString, bytes: Vec<u8> },
}

const TAG_NONE: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_DECIMAL: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_CUSTOM: u8 = 7;

impl Value {
    pub fn float(value: f64) -> Self {
        Value::Float(OrderedFloat(value))
    }

    /// Wrap a user type into its wire form.
    pub fn custom(value: &dyn CustomValue) -> Self {
        Value::Custom {
            tag: value.type_tag(),
            bytes: value.pack_custom(),
        }
    }

    pub const fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// The stable type tag id, shared by all replicas.
    pub const fn type_tag_id(&self) -> u8 {
        match self {
            Value::None => TAG_NONE,
            Value::Int(_) => TAG_INT,
            Value::Float(_) => TAG_FLOAT,
            Value::Decimal(_) => TAG_DECIMAL,
            Value::Str(_) => TAG_STR,
            Value::Bytes(_) => TAG_BYTES,
            Value::List(_) => TAG_LIST,
            Value::Custom { .. } => TAG_CUSTOM,
        }
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.pack_body(&mut out);
        out
    }

    fn pack_body(&self, out: &mut Vec<u8>) {
        match self {
            Value::None => {}
            Value::Int(i) => codec::put_i64(out, *i),
            Value::Float(f) => codec::put_f64(out, f.into_inner()),
            Value::Decimal(d) => codec::put_str_seq(out, &canonical_decimal_text(d)),
            Value::Str(s) => codec::put_str_seq(out, s),
            Value::Bytes(b) => codec::put_byte_seq(out, b),
            Value::List(items) => {
                codec::put_len(out, items.len());
                for item in items {
                    item.pack_into(out);
                }
            }
            Value::Custom { tag, bytes } => {
                codec::put_str_seq(out, tag.as_str());
                codec::put_byte_seq(out, bytes);
            }
        }
    }

    /// Resolve a [[Value::Custom]] payload through the registry.
    ///
    /// Returns `None` for non-custom values and for tags the registry does
    /// not know.
    pub fn resolve_custom(
        &self,
        inject: &Inject,
    ) -> Option<Result<Box<dyn CustomValue>, CodecError>> {
        match self {
            Value::Custom { tag, bytes } => inject.factory(tag).map(|factory| factory(bytes)),
            _ => None,
        }
    }
}

impl Packable for Value {
    fn pack_into(&self, out: &mut Vec<u8>) {
        codec::put_u8(out, self.type_tag_id());
        self.pack_body(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let tag = reader.u8()?;
        match tag {
            TAG_NONE => Ok(Value::None),
            TAG_INT => Ok(Value::Int(reader.i64()?)),
            TAG_FLOAT => Ok(Value::Float(OrderedFloat(reader.f64()?))),
            TAG_DECIMAL => {
                let text = reader.str_seq()?;
                let decimal =
                    BigDecimal::from_str(&text).ok().context(DecimalTextSnafu { text })?;
                Ok(Value::Decimal(decimal))
            }
            TAG_STR => Ok(Value::Str(reader.str_seq()?)),
            TAG_BYTES => Ok(Value::Bytes(reader.byte_seq()?.to_vec())),
            TAG_LIST => {
                let count = reader.u32()? as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(Value::unpack_from(reader, inject)?);
                }
                Ok(Value::List(items))
            }
            TAG_CUSTOM => {
                let tag = IString::from(reader.str_seq()?);
                let bytes = reader.byte_seq()?.to_vec();
                if let Some(factory) = inject.factory(&tag) {
                    // Known tags must resolve; this catches corrupt payloads
                    // at the codec boundary instead of at first use.
                    factory(&bytes)?;
                }
                Ok(Value::Custom { tag, bytes })
            }
            _ => UnknownTagSnafu { tag, what: "value" }.fail(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == cmp::Ordering::Equal
    }
}
impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Value {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.type_tag_id()
            .cmp(&other.type_tag_id())
            .then_with(|| self.body_bytes().cmp(&other.body_bytes()))
    }
}
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.type_tag_id());
        state.write(&self.body_bytes());
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::float(value)
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}
impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}
impl From<BigDecimal> for Value {
    fn from(value: BigDecimal) -> Self {
        Value::Decimal(value)
    }
}
impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

/// Plain-text form with a normalized mantissa, so that `1.10` and `1.1`
/// produce the same bytes everywhere.
fn canonical_decimal_text(decimal: &BigDecimal) -> String {
    let normalized = decimal.normalized();
    let (digits, scale) = normalized.as_bigint_and_exponent();
    let negative = digits.sign() == Sign::Minus;
    let magnitude = digits.magnitude().to_string();

    let mut text = String::with_capacity(magnitude.len() + 2);
    if negative {
        text.push('-');
    }
    if scale <= 0 {
        text.push_str(&magnitude);
        for _ in 0..scale.unsigned_abs() {
            text.push('0');
        }
    } else if (magnitude.len() as i64) > scale {
        let point = magnitude.len() - scale as usize;
        text.push_str(&magnitude[..point]);
        text.push('.');
        text.push_str(&magnitude[point..]);
    } else {
        text.push_str("0.");
        for _ in 0..(scale as usize - magnitude.len()) {
            text.push('0');
        }
        text.push_str(&magnitude);
    }
    text
}

/// Contract for user-defined payload types.
///
/// Implementations must encode deterministically: the same logical value
/// packs to the same bytes on every replica.
pub trait CustomValue: fmt::Debug {
    /// The stable tag identifying this type on the wire.
    fn type_tag(&self) -> IString;

    /// The canonical byte form of this instance.
    fn pack_custom(&self) -> Vec<u8>;
}

/// Factory resolving the byte form of one custom type back into an instance.
pub type CustomFactory =
    Box<dyn Fn(&[u8]) -> Result<Box<dyn CustomValue>, CodecError> + Send + Sync>;

/// Registry of [[CustomFactory]] instances keyed by type tag.
///
/// Passed into every `unpack` entry point; unknown tags pass through
/// untouched, known tags are validated eagerly.
#[derive(Default)]
pub struct Inject {
    factories: BTreeMap<IString, CustomFactory>,
}
impl Inject {
    pub const EMPTY: Inject = Inject {
        factories: BTreeMap::new(),
    };

    pub fn register(&mut self, tag: impl Into<IString>, factory: CustomFactory) {
        self.factories.insert(tag.into(), factory);
    }

    pub fn with(mut self, tag: impl Into<IString>, factory: CustomFactory) -> Self {
        self.register(tag, factory);
        self
    }

    pub fn factory(&self, tag: &IString) -> Option<&CustomFactory> {
        self.factories.get(tag)
    }
}
impl fmt::Debug for Inject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inject")
            .field("tags", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Convenience for rejecting payloads inside a [[CustomFactory]].
pub fn reject_custom(tag: impl Into<IString>, reason: impl Into<String>) -> CodecError {
    CustomRejectedSnafu {
        tag: tag.into(),
        reason: reason.into(),
    }
    .build()
}
