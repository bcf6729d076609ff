//! Ordered list data types.
//!
//! Three different orders over the same delta machinery: the total
//! `(timestamp, writer, value)` order of [[RgArray]], the fractional indices
//! of [[FiArray]], and the parent-linked traversal of [[CausalTree]]. All
//! three keep a sorted cache that is patched in place as updates apply.

use deltasync_core::{DeltaCrdt, Result, StateUpdate, TimestampOf, Value};

mod causal_tree;
mod fi_array;
mod rg_array;

pub use causal_tree::{CausalTree, CtNode};
pub use fi_array::{FiArray, FiaItem, MoveTarget};
pub use rg_array::{ItemWrapper, RgArray, RgaDelta, RgaOp};

/// The list surface shared by the three ordered types.
pub trait ListCrdt: DeltaCrdt {
    /// Number of visible items.
    fn list_len(&self) -> usize;

    fn is_list_empty(&self) -> bool {
        self.list_len() == 0
    }

    /// The visible values in list order.
    fn read_list(&self) -> Vec<Value>;

    /// Add `value` at the end of the list.
    fn append_value(
        &mut self,
        value: Value,
        writer: &Value,
    ) -> Result<StateUpdate<Self::Payload, TimestampOf<Self>>>;

    /// Delete the visible item at `index`.
    ///
    /// Out-of-bounds indices are an error; the state is unchanged.
    fn remove_at(
        &mut self,
        index: usize,
        writer: &Value,
    ) -> Result<StateUpdate<Self::Payload, TimestampOf<Self>>>;
}

/// Fresh random identity for one list item.
pub(crate) fn generate_item_uuid() -> Vec<u8> {
    uuid::Uuid::new_v4().as_bytes().to_vec()
}
