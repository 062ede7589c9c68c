//! Reducer cells.

use crate::error::Result;
use crate::reactive::{CellValue, WritableCell};

/// A primitive cell written with actions folded in by `reduce`.
///
/// ```rust,ignore
/// enum Op { Inc, Dec }
/// let count = reducer(0, |n: &i32, op: Op| match op {
///     Op::Inc => n + 1,
///     Op::Dec => n - 1,
/// });
/// store.set(&count, Op::Inc)?;
/// ```
pub fn reducer<T, A, F>(init: T, reduce: F) -> WritableCell<T, A>
where
    T: CellValue,
    A: 'static,
    F: Fn(&T, A) -> T + 'static,
{
    WritableCell::with_init(init, move |set, action: A| -> Result<()> {
        let current = set.get_self()?;
        set.set_value(reduce(&current, action))
    })
}
