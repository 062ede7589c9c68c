//! Graph Nodes
//!
//! Per-store records for cells: the state every touched cell carries, and
//! the extra record kept while a cell is mounted.

use std::rc::{Rc, Weak};

use indexmap::{IndexMap, IndexSet};

use crate::error::{Error, Result};
use crate::reactive::pending::PendingToken;
use crate::reactive::subscriber::ListenerId;
use crate::reactive::{CellDef, CellId, OnUnmount, Read, Value};

/// A dependency as observed by the last derivation.
#[derive(Clone)]
pub(crate) struct Dependency {
    pub(crate) def: Rc<CellDef>,
    /// Revision of the dependency when it was read.
    pub(crate) revision: u64,
}

/// Status of a cell, without its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Status {
    /// Never computed.
    Uninitialized,
    /// Holds a settled value.
    Value,
    /// Holds a derivation error.
    Error,
    /// Waiting for an asynchronous resolution.
    Pending,
}

/// Consistent view of a cell returned by the evaluator.
pub(crate) struct Observation {
    pub(crate) revision: u64,
    pub(crate) outcome: Result<Value>,
}

/// What a state transition replaced.
///
/// Holds user values, so callers drop it after releasing the graph.
#[must_use]
#[derive(Default)]
pub(crate) struct Displaced {
    /// Pending token superseded by the transition.
    pub(crate) token: Option<PendingToken>,
    pub(crate) value: Option<Value>,
    pub(crate) error: Option<Error>,
}

/// Mutable state of one cell in one store.
pub(crate) struct CellState {
    def: Weak<CellDef>,
    /// Last settled value.
    value: Option<Value>,
    /// Last derivation failure. Exclusive with a current value.
    error: Option<Error>,
    /// Outstanding asynchronous resolution.
    pending: Option<PendingToken>,
    /// Bumped on every observable change.
    revision: u64,
    /// Cells read by the last derivation, in read order.
    pub(crate) dependencies: IndexMap<CellId, Dependency>,
}

impl CellState {
    /// Create the state for a definition.
    ///
    /// Source and effect cells start initialized; derived cells start empty.
    pub(crate) fn new(def: &Rc<CellDef>) -> Self {
        let value = match &def.read {
            Read::Source(init) => Some(Rc::clone(init)),
            Read::Lazy(init) => Some(init()),
            Read::Effect(_) => Some(Rc::new(()) as Value),
            Read::Derive(_) => None,
        };
        Self {
            def: Rc::downgrade(def),
            value,
            error: None,
            pending: None,
            revision: 0,
            dependencies: IndexMap::new(),
        }
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.value.is_some() || self.error.is_some() || self.pending.is_some()
    }

    /// Whether every handle to the definition has been dropped.
    pub(crate) fn is_orphaned(&self) -> bool {
        self.def.strong_count() == 0
    }

    pub(crate) fn pending(&self) -> Option<&PendingToken> {
        self.pending.as_ref()
    }

    pub(crate) fn last_value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub(crate) fn status(&self) -> Status {
        if self.pending.is_some() {
            Status::Pending
        } else if self.error.is_some() {
            Status::Error
        } else if self.value.is_some() {
            Status::Value
        } else {
            Status::Uninitialized
        }
    }

    /// What a reader of this cell sees right now.
    pub(crate) fn observe(&self, id: CellId) -> Observation {
        let outcome = if self.pending.is_some() {
            Err(Error::Pending(id))
        } else if let Some(error) = &self.error {
            Err(error.clone())
        } else if let Some(value) = &self.value {
            Ok(Rc::clone(value))
        } else {
            Err(Error::Invariant(format!("{id} read before initialization")))
        };
        Observation {
            revision: self.revision,
            outcome,
        }
    }

    /// Store a settled value; the revision moves only if the value changed.
    ///
    /// `equal` is the caller's comparison of `value` with [`last_value`],
    /// made with the graph released. It only counts when the cell holds
    /// that value and is neither pending nor failed. An unchanged value
    /// keeps the previous one.
    ///
    /// [`last_value`]: CellState::last_value
    pub(crate) fn set_value(&mut self, value: Value, equal: bool) -> Displaced {
        let token = self.pending.take();
        let unchanged = equal && token.is_none() && self.error.is_none() && self.value.is_some();
        if unchanged {
            return Displaced {
                token,
                value: Some(value),
                error: None,
            };
        }
        self.revision += 1;
        Displaced {
            token,
            value: self.value.replace(value),
            error: self.error.take(),
        }
    }

    /// Store a derivation failure.
    pub(crate) fn set_error(&mut self, error: Error) -> Displaced {
        self.revision += 1;
        Displaced {
            token: self.pending.take(),
            value: self.value.take(),
            error: self.error.replace(error),
        }
    }

    /// Mark the cell pending on a new token.
    ///
    /// The last settled value is kept for inspection but no longer served.
    pub(crate) fn set_pending(&mut self, token: PendingToken) -> Displaced {
        self.revision += 1;
        Displaced {
            token: self.pending.replace(token),
            value: None,
            error: self.error.take(),
        }
    }

    /// Commit the result of the current pending token.
    pub(crate) fn settle(&mut self, result: Result<Value>) -> Displaced {
        self.revision += 1;
        let token = self.pending.take();
        match result {
            Ok(value) => Displaced {
                token,
                value: self.value.replace(value),
                error: self.error.take(),
            },
            Err(error) => Displaced {
                token,
                value: self.value.take(),
                error: self.error.replace(error),
            },
        }
    }
}

/// Record kept while a cell is mounted.
pub(crate) struct Mounted {
    pub(crate) def: Rc<CellDef>,
    /// External listeners.
    pub(crate) listeners: IndexMap<ListenerId, Rc<dyn Fn()>>,
    /// Mounted cells this cell depends on.
    pub(crate) dependencies: IndexSet<CellId>,
    /// Mounted cells that depend on this cell.
    pub(crate) dependents: IndexSet<CellId>,
    /// Returned by the mount hook.
    pub(crate) on_unmount: Option<OnUnmount>,
}

impl Mounted {
    pub(crate) fn new(def: Rc<CellDef>, dependencies: IndexSet<CellId>) -> Self {
        Self {
            def,
            listeners: IndexMap::new(),
            dependencies,
            dependents: IndexSet::new(),
            on_unmount: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Cell, WritableCell};

    #[test]
    fn source_state_starts_initialized() {
        let cell = WritableCell::primitive(3);
        let state = CellState::new(&cell.def);
        assert!(state.is_initialized());
        assert_eq!(state.status(), Status::Value);
        assert_eq!(state.revision(), 0);
    }

    #[test]
    fn derived_state_starts_empty() {
        let cell = Cell::derived(|_| Ok(1));
        let state = CellState::new(&cell.def);
        assert!(!state.is_initialized());
        assert!(state.observe(cell.id()).outcome.is_err());
    }

    #[test]
    fn equal_values_keep_revision() {
        let cell = WritableCell::primitive(3);
        let mut state = CellState::new(&cell.def);

        let kept = state.set_value(Rc::new(3), true);
        assert_eq!(state.revision(), 0);
        assert!(kept.value.is_some_and(|v| v.downcast_ref::<i32>() == Some(&3)));

        let replaced = state.set_value(Rc::new(4), false);
        assert_eq!(state.revision(), 1);
        assert!(replaced.value.is_some_and(|v| v.downcast_ref::<i32>() == Some(&3)));
    }

    #[test]
    fn errors_clear_values_and_bump() {
        let cell = Cell::derived(|_| Ok(1));
        let mut state = CellState::new(&cell.def);

        let _ = state.set_value(Rc::new(1), false);
        let displaced = state.set_error(Error::msg("boom"));
        assert!(displaced.value.is_some());
        assert_eq!(state.status(), Status::Error);
        assert_eq!(state.revision(), 2);
        assert!(state.last_value().is_none());
    }

    #[test]
    fn equal_flag_is_ignored_for_uninitialized_cells() {
        let cell = Cell::derived(|_| Ok(1));
        let mut state = CellState::new(&cell.def);
        let _ = state.set_value(Rc::new(1), true);
        assert_eq!(state.status(), Status::Value);
        assert_eq!(state.revision(), 1);
    }

    #[test]
    fn lazy_sources_initialize_on_creation() {
        let made = Rc::new(std::cell::Cell::new(0));
        let m = Rc::clone(&made);
        let cell = WritableCell::from_lazy_init(move || {
            m.set(m.get() + 1);
            9
        });
        assert_eq!(made.get(), 0);
        let state = CellState::new(&cell.def);
        assert_eq!(made.get(), 1);
        assert_eq!(state.status(), Status::Value);
    }

    #[test]
    fn orphaned_once_handles_drop() {
        let cell = WritableCell::primitive(0);
        let state = CellState::new(&cell.def);
        assert!(!state.is_orphaned());
        drop(cell);
        assert!(state.is_orphaned());
    }
}
