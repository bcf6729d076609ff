#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]

//! The replication substrate shared by all data types:
//! logical clocks, the [[Value]] model, the canonical codec,
//! delta envelopes, history digests, and listener dispatch.

pub mod clock;
pub mod codec;
pub mod crdt;
pub mod errors;
pub mod history;
pub mod listeners;
pub mod update;
pub mod value;

pub use clock::{CausalOrdering, Clock, ClockUuid, LamportClock, VectorClock, VectorStamp};
pub use codec::{ByteReader, CodecError, Packable};
pub use crdt::{DeltaCrdt, TimestampOf, timestamp_in_range};
pub use errors::{CrdtError, Result};
pub use history::{Checksums, Digest, MerkleHistory, checksums_over};
pub use listeners::{ListenerError, ListenerId, ListenerResult, Listeners};
pub use update::StateUpdate;
pub use value::{CustomValue, Inject, Value};
