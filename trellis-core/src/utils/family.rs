//! Keyed families of cells.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;

/// Creates one cell per key and hands back the same cell for the same key.
///
/// Families only cache handles. Removing a key drops the family's handle;
/// stores release the cell's state once every other handle is gone and
/// [`Store::collect_garbage`](crate::reactive::Store::collect_garbage) runs.
pub struct CellFamily<K, C> {
    create: Box<dyn Fn(&K) -> C>,
    cells: RefCell<HashMap<K, C>>,
}

impl<K, C> CellFamily<K, C>
where
    K: Eq + Hash + Clone,
    C: Clone,
{
    pub fn new(create: impl Fn(&K) -> C + 'static) -> Self {
        Self {
            create: Box::new(create),
            cells: RefCell::new(HashMap::new()),
        }
    }

    /// The cell for `key`, created on first use.
    pub fn get(&self, key: &K) -> C {
        if let Some(cell) = self.cells.borrow().get(key) {
            return cell.clone();
        }
        let cell = (self.create)(key);
        self.cells.borrow_mut().insert(key.clone(), cell.clone());
        cell
    }

    /// Forget the cell for `key`. The next `get` creates a new one.
    pub fn remove(&self, key: &K) -> Option<C> {
        self.cells.borrow_mut().remove(key)
    }

    /// Keep only the keys for which `keep` returns true.
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        self.cells.borrow_mut().retain(|key, _| keep(key));
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cells.borrow().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cells.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.borrow().is_empty()
    }
}
