//! Pre-apply listener dispatch.
//!
//! Listeners observe every state update before it mutates the data type; a
//! failing listener vetoes the apply and the state is left untouched.

use snafu::prelude::*;
use std::fmt;

pub type ListenerResult = std::result::Result<(), ListenerError>;

#[derive(Debug, Snafu)]
#[snafu(display("{reason}"))]
pub struct ListenerError {
    reason: String,
}
impl ListenerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Handle returned by [[Listeners::add]]; used to unregister.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An ordered registry of update callbacks.
///
/// Registration order is dispatch order. The registry is deliberately
/// invisible to equality and cloning: listeners are borrowed observers of
/// one instance, not replicated state.
pub struct Listeners<U> {
    next_id: u64,
    entries: Vec<(ListenerId, Box<dyn Fn(&U) -> ListenerResult>)>,
}
impl<U> Listeners<U> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, listener: Box<dyn Fn(&U) -> ListenerResult>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    /// Returns whether the id was registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        before != self.entries.len()
    }

    /// Invoke all listeners in registration order.
    ///
    /// Stops at the first failure and returns it.
    pub fn invoke(&self, update: &U) -> ListenerResult {
        for (_, listener) in &self.entries {
            listener(update)?;
        }
        Ok(())
    }
}
impl<U> Default for Listeners<U> {
    fn default() -> Self {
        Self::new()
    }
}
impl<U> Clone for Listeners<U> {
    /// Clones start with an empty registry; listener registrations belong to
    /// one instance.
    fn clone(&self) -> Self {
        Self::new()
    }
}
impl<U> PartialEq for Listeners<U> {
    /// Listener registries are not observable state.
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}
impl<U> Eq for Listeners<U> {}
impl<U> fmt::Debug for Listeners<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}
