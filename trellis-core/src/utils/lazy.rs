//! Lazily initialized cells.

use crate::reactive::{CellValue, PrimitiveCell, WritableCell};

/// Create a primitive cell whose initial value is made on first use.
///
/// `init` runs once in each store that touches the cell, when it first
/// does. Writes behave as for [`WritableCell::primitive`].
pub fn lazy<T: CellValue>(init: impl Fn() -> T + 'static) -> PrimitiveCell<T> {
    WritableCell::from_lazy_init(init)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Cell, SetAction, Store};
    use std::cell::Cell as Counter;
    use std::rc::Rc;

    #[test]
    fn init_runs_once_per_store() {
        let calls = Rc::new(Counter::new(0));
        let c = Rc::clone(&calls);
        let seed = lazy(move || {
            c.set(c.get() + 1);
            vec![1, 2, 3]
        });
        assert_eq!(calls.get(), 0);

        let a = Store::new();
        assert_eq!(a.get(&seed).unwrap(), vec![1, 2, 3]);
        assert_eq!(a.get(&seed).unwrap(), vec![1, 2, 3]);
        assert_eq!(calls.get(), 1);

        let b = Store::new();
        b.set(&seed, SetAction::update(|v: &Vec<i32>| v.iter().map(|n| n * 2).collect()))
            .unwrap();
        assert_eq!(b.get(&seed).unwrap(), vec![2, 4, 6]);
        assert_eq!(a.get(&seed).unwrap(), vec![1, 2, 3]);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn dependents_see_the_lazy_value() {
        let store = Store::new();
        let seed = lazy(|| 21);
        let s = seed.clone();
        let doubled = Cell::derived(move |get| Ok(get.get(&s)? * 2));

        let _sub = store.sub(&doubled, || {}).unwrap();
        assert_eq!(store.get(&doubled).unwrap(), 42);
        store.set(&seed, 5).unwrap();
        assert_eq!(store.get(&doubled).unwrap(), 10);
    }
}
