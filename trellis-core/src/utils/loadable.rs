//! Loadable wrappers.

use crate::error::Error;
use crate::reactive::{Cell, CellValue};

/// The state of a cell as a value: pending, settled, or failed.
#[derive(Debug, Clone)]
pub enum Loadable<T> {
    Loading,
    Ready(T),
    Failed(Error),
}

impl<T> Loadable<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, Loadable::Loading)
    }

    /// The settled value, if any.
    pub fn ready(&self) -> Option<&T> {
        match self {
            Loadable::Ready(value) => Some(value),
            _ => None,
        }
    }
}

// Failures never compare equal, so every new failure is a change.
impl<T: PartialEq> PartialEq for Loadable<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Loadable::Loading, Loadable::Loading) => true,
            (Loadable::Ready(a), Loadable::Ready(b)) => a == b,
            _ => false,
        }
    }
}

/// Wrap a cell so that reading it never fails or pends.
pub fn loadable<T: CellValue>(cell: &Cell<T>) -> Cell<Loadable<T>> {
    let source = cell.clone();
    Cell::derived(move |get| {
        Ok(match get.get(&source) {
            Ok(value) => Loadable::Ready(value),
            Err(Error::Pending(_)) => Loadable::Loading,
            Err(error) => Loadable::Failed(error),
        })
    })
}
