//! Refreshable cells.

use crate::error::Result;
use crate::reactive::{Cell, CellValue, Getter, SetAction, WritableCell};

/// Write argument that forces a refreshable cell to recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Refresh;

/// A derived cell that recomputes when written with [`Refresh`], even if
/// none of its dependencies changed.
pub fn refreshable<T, F>(derive: F) -> WritableCell<T, Refresh>
where
    T: CellValue,
    F: Fn(&Getter<'_>) -> Result<T> + 'static,
{
    let generation = WritableCell::primitive(0_u64).private();
    let read_side: Cell<u64> = generation.as_cell().clone();
    WritableCell::derived(
        move |get| {
            get.get(&read_side)?;
            derive(get)
        },
        move |set, _: Refresh| set.set(&generation, SetAction::update(|n: &u64| n + 1)),
    )
}
