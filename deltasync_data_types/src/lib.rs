#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]

//! The replicated data types.
//!
//! Every type here follows the same life cycle: local mutators produce a
//! [[deltasync_core::StateUpdate]], apply it to the local state, and return
//! it for propagation; incoming updates are validated, dispatched to
//! listeners, and merged monotonically. Two replicas that have applied the
//! same set of updates, in any order, read the same state.

pub mod counters;
pub mod lists;
pub mod registers;
pub mod sets;

pub use counters::{Counter, CounterDelta, CounterSet, CounterSetDelta, PnCounter, PnCounterDelta};
pub use lists::{CausalTree, CtNode, FiArray, FiaItem, ItemWrapper, ListCrdt, MoveTarget, RgArray, RgaDelta, RgaOp};
pub use registers::{
    LwwMap, LwwMapDelta, LwwRegister, LwwRegisterDelta, MapOp, MvMap, MvMapDelta, MvRegister,
    MvRegisterDelta,
};
pub use sets::{GSet, GSetDelta, OrSet, OrSetDelta, SetOp};
