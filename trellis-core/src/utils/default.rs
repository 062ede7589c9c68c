//! Resettable cells and cells with a derived default.

use crate::error::Result;
use crate::reactive::{CellValue, Getter, SetAction, WritableCell};

/// Write argument of resettable cells.
pub enum ResetAction<T> {
    /// Write like a primitive cell.
    Set(SetAction<T>),
    /// Return to the initial value, or to the derived default.
    Reset,
}

impl<T> From<T> for ResetAction<T> {
    fn from(value: T) -> Self {
        ResetAction::Set(SetAction::Value(value))
    }
}

impl<T> From<SetAction<T>> for ResetAction<T> {
    fn from(action: SetAction<T>) -> Self {
        ResetAction::Set(action)
    }
}

/// A primitive cell that can be reset to its initial value.
pub fn resettable<T: CellValue>(init: T) -> WritableCell<T, ResetAction<T>> {
    let initial = init.clone();
    WritableCell::with_init(init, move |set, action: ResetAction<T>| match action {
        ResetAction::Reset => set.set_value(initial.clone()),
        ResetAction::Set(update) => {
            let current = set.get_self()?;
            set.set_value(update.apply(&current))
        }
    })
}

/// A writable cell that follows `derive` until it is written.
///
/// Once written, it holds the written value and ignores the derivation.
/// [`ResetAction::Reset`] makes it follow the derivation again.
pub fn with_default<T, F>(derive: F) -> WritableCell<T, ResetAction<T>>
where
    T: CellValue,
    F: Fn(&Getter<'_>) -> Result<T> + 'static,
{
    let overwritten = WritableCell::primitive(None::<T>).private();
    let read_side = overwritten.clone();
    WritableCell::derived(
        move |get| match get.get(&read_side)? {
            Some(value) => Ok(value),
            None => derive(get),
        },
        move |set, action: ResetAction<T>| match action {
            ResetAction::Reset => set.set(&overwritten, None),
            ResetAction::Set(update) => {
                let current = set.get_self()?;
                set.set(&overwritten, Some(update.apply(&current)))
            }
        },
    )
}
