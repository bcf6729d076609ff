//! Numeric data types: monotone counters and their compositions.

mod counter;
mod counter_set;
mod pn_counter;

pub use counter::{Counter, CounterDelta};
pub use counter_set::{CounterSet, CounterSetDelta};
pub use pn_counter::{PnCounter, PnCounterDelta};
