//! Async cells read as plain values.

use crate::error::Error;
use crate::reactive::{Cell, CellValue};

/// Wrap a cell so that reading it never pends.
///
/// While `cell` is pending the wrapper holds `fallback(previous)`, where
/// `previous` is the last value `cell` settled on in the store. Failures
/// pass through unchanged.
pub fn unwrap<T, F>(cell: &Cell<T>, fallback: F) -> Cell<T>
where
    T: CellValue,
    F: Fn(Option<&T>) -> T + 'static,
{
    let source = cell.clone();
    Cell::derived(move |get| match get.get(&source) {
        Err(Error::Pending(_)) => Ok(fallback(get.last_settled(&source).as_ref())),
        other => other,
    })
}
