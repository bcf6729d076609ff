use crate::clock::ClockUuid;
use crate::codec::CodecError;
use crate::listeners::ListenerError;
use snafu::prelude::*;

pub type Result<T, E = CrdtError> = std::result::Result<T, E>;

/// Everything the library surfaces to callers.
///
/// Failing operations never leave a data type partially updated: validation
/// and listener dispatch happen before any mutation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CrdtError {
    #[snafu(display("{what} has the wrong type: expected {expected}"))]
    WrongType {
        what: &'static str,
        expected: &'static str,
    },
    #[snafu(display("{what} violates the value contract: {reason}"))]
    InvalidValue { what: &'static str, reason: String },
    #[snafu(display(
        "State update belongs to clock {actual}, but this instance uses clock {expected}"
    ))]
    ClockMismatch {
        expected: ClockUuid,
        actual: ClockUuid,
    },
    #[snafu(display("Malformed bytes: {source}"))]
    Codec { source: CodecError },
    #[snafu(display("{what} is not present in this instance"))]
    MissingItem { what: String },
    #[snafu(display("Index {index} is out of bounds (length {len})"))]
    OutOfBounds { index: usize, len: usize },
    #[snafu(display("A listener rejected the update: {source}"))]
    ListenerRejected { source: ListenerError },
}
