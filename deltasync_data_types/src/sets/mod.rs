//! Set data types and the observed/removed machinery shared with the list
//! types.

use deltasync_core::Clock;
use std::collections::BTreeMap;

mod g_set;
mod or_set;

pub use g_set::{GSet, GSetDelta};
pub use or_set::{OrSet, OrSetDelta, SetOp};

/// Visibility of one member before and after an apply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Transition {
    pub was_visible: bool,
    pub now_visible: bool,
}

/// The add-biased observed/removed core.
///
/// Each member carries the join of its observe stamps and the join of its
/// remove stamps; a member is visible unless its remove stamp is strictly
/// later than its observe stamp. Joins take the `Ord`-maximum, which is
/// order-independent because the storage order linearly extends the causal
/// order (see [[Clock]]).
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OrSetState<M, C: Clock> {
    observed: BTreeMap<M, C::Timestamp>,
    removed: BTreeMap<M, C::Timestamp>,
}
impl<M, C> OrSetState<M, C>
where
    M: Clone + Ord,
    C: Clock,
{
    pub(crate) fn new() -> Self {
        Self {
            observed: BTreeMap::new(),
            removed: BTreeMap::new(),
        }
    }

    pub(crate) fn observe(&mut self, member: M, ts: C::Timestamp) -> Transition {
        let was_visible = self.is_visible(&member);
        join_stamp(self.observed.entry(member.clone()).or_insert_with(C::default_ts), ts);
        Transition {
            was_visible,
            now_visible: self.is_visible(&member),
        }
    }

    pub(crate) fn remove(&mut self, member: M, ts: C::Timestamp) -> Transition {
        let was_visible = self.is_visible(&member);
        join_stamp(self.removed.entry(member.clone()).or_insert_with(C::default_ts), ts);
        Transition {
            was_visible,
            now_visible: self.is_visible(&member),
        }
    }

    /// Add-biased visibility: ties and concurrent stamps keep the member.
    pub(crate) fn is_visible(&self, member: &M) -> bool {
        let Some(observed_ts) = self.observed.get(member) else {
            return false;
        };
        match self.removed.get(member) {
            None => true,
            Some(removed_ts) => !C::is_later(removed_ts, observed_ts),
        }
    }

    pub(crate) fn iter_visible(&self) -> impl Iterator<Item = &M> {
        self.observed
            .keys()
            .filter(|member| self.is_visible(member))
    }

    pub(crate) fn iter_observed(&self) -> impl Iterator<Item = (&M, &C::Timestamp)> {
        self.observed.iter()
    }

    pub(crate) fn iter_removed(&self) -> impl Iterator<Item = (&M, &C::Timestamp)> {
        self.removed.iter()
    }

    pub(crate) fn insert_observed(&mut self, member: M, ts: C::Timestamp) {
        self.observed.insert(member, ts);
    }

    pub(crate) fn insert_removed(&mut self, member: M, ts: C::Timestamp) {
        self.removed.insert(member, ts);
    }

    pub(crate) fn observed_len(&self) -> usize {
        self.observed.len()
    }

    pub(crate) fn removed_len(&self) -> usize {
        self.removed.len()
    }
}

/// Keep the later stamp; `false` means the slot already was at least `ts`.
pub(crate) fn join_stamp<TS: Ord>(slot: &mut TS, ts: TS) -> bool {
    if ts > *slot {
        *slot = ts;
        true
    } else {
        false
    }
}
