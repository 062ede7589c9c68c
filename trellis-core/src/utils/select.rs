//! Projections of a cell.

use crate::reactive::{Cell, CellValue};

/// A derived cell holding `project` applied to `cell`.
///
/// Dependents are recomputed only when the projection changes, not
/// whenever `cell` does.
pub fn select<T, S, F>(cell: &Cell<T>, project: F) -> Cell<S>
where
    T: CellValue,
    S: CellValue,
    F: Fn(&T) -> S + 'static,
{
    let source = cell.clone();
    Cell::derived(move |get| Ok(project(&get.get(&source)?)))
}

/// Like [`select`], with a custom equality for the projection.
///
/// When `eq` holds, the previous projection is kept.
pub fn select_with<T, S, F, E>(cell: &Cell<T>, project: F, eq: E) -> Cell<S>
where
    T: CellValue,
    S: CellValue,
    F: Fn(&T) -> S + 'static,
    E: Fn(&S, &S) -> bool + 'static,
{
    let source = cell.clone();
    Cell::derived_with_eq(move |get| Ok(project(&get.get(&source)?)), eq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Store, WritableCell};
    use std::cell::Cell as Counter;
    use std::rc::Rc;

    #[derive(Clone, PartialEq)]
    struct User {
        name: String,
        visits: u32,
    }

    #[test]
    fn unrelated_changes_do_not_propagate() {
        let store = Store::new();
        let user = WritableCell::primitive(User {
            name: "ada".into(),
            visits: 0,
        });
        let name = select(&user, |u: &User| u.name.clone());

        let calls = Rc::new(Counter::new(0));
        let n = Rc::clone(&calls);
        let _sub = store.sub(&name, move || n.set(n.get() + 1)).unwrap();

        store
            .set(&user, User { name: "ada".into(), visits: 1 })
            .unwrap();
        assert_eq!(calls.get(), 0);

        store
            .set(&user, User { name: "grace".into(), visits: 1 })
            .unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(store.get(&name).unwrap(), "grace");
    }

    #[test]
    fn custom_equality_keeps_previous_projection() {
        let store = Store::new();
        let values = WritableCell::primitive(vec![1, 2, 3]);
        let len_class = select_with(
            &values,
            |v: &Vec<i32>| v.clone(),
            |a: &Vec<i32>, b: &Vec<i32>| a.len() == b.len(),
        );

        let _sub = store.sub(&len_class, || {}).unwrap();
        store.set(&values, vec![4, 5, 6]).unwrap();
        assert_eq!(store.get(&len_class).unwrap(), vec![1, 2, 3]);

        store.set(&values, vec![7]).unwrap();
        assert_eq!(store.get(&len_class).unwrap(), vec![7]);
    }
}
