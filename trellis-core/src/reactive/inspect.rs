//! Inspection and snapshots.
//!
//! Read-only views for devtools, and a way to capture primitive values and
//! replay them into a store.

use std::rc::Rc;

use serde::Serialize;

use super::cell::{Cell, CellDef, CellValue, PrimitiveCell, SetAction};
use super::runtime::Store;
use super::CellId;
use crate::error::{Error, Result};
use crate::graph::Status;

/// What the store knows about one mounted cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellInfo {
    pub id: CellId,
    pub label: Option<String>,
    pub revision: u64,
    pub status: Status,
    pub dependencies: Vec<CellId>,
    pub dependents: Vec<CellId>,
    pub listeners: usize,
}

impl Store {
    /// Enumerate mounted cells, ordered by ID. Private cells are skipped.
    pub fn mounted_cells(&self) -> Vec<CellInfo> {
        let graph = self.inner.graph.borrow();
        let mut cells: Vec<CellInfo> = graph
            .mounted
            .iter()
            .filter(|(_, mounted)| !mounted.def.is_private())
            .map(|(id, mounted)| {
                let state = graph.states.get(id);
                CellInfo {
                    id: *id,
                    label: mounted.def.label(),
                    revision: state.map_or(0, |s| s.revision()),
                    status: state.map_or(Status::Uninitialized, |s| s.status()),
                    dependencies: mounted.dependencies.iter().copied().collect(),
                    dependents: mounted.dependents.iter().copied().collect(),
                    listeners: mounted.listeners.len(),
                }
            })
            .collect();
        cells.sort_by_key(|info| info.id);
        cells
    }

    /// Status of a cell in this store, without computing it.
    pub fn status<T>(&self, cell: &Cell<T>) -> Status {
        self.inner
            .graph
            .borrow()
            .states
            .get(&cell.id())
            .map_or(Status::Uninitialized, |state| state.status())
    }

    /// Replay a snapshot through the ordinary write path, as one transaction.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let depth = &self.inner.batch_depth;
        depth.set(depth.get() + 1);
        let mut errors: Vec<Error> = snapshot
            .entries
            .iter()
            .filter_map(|entry| (entry.write)(self).err())
            .collect();
        depth.set(depth.get() - 1);
        if let Err(error) = self.end_transaction() {
            errors.push(error);
        }
        Error::collect(errors)
    }

    /// Capture the current values of the given primitive cells.
    pub fn snapshot<T: CellValue>(&self, cells: &[&PrimitiveCell<T>]) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();
        for cell in cells {
            snapshot.insert(cell, self.get(cell)?);
        }
        Ok(snapshot)
    }
}

struct Entry {
    def: Rc<CellDef>,
    write: Rc<dyn Fn(&Store) -> Result<()>>,
}

/// Values for primitive cells, replayed with [`Store::restore`].
#[derive(Default, Clone)]
pub struct Snapshot {
    entries: Vec<Entry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value for a cell. A later value for the same cell wins.
    pub fn insert<T: CellValue>(&mut self, cell: &PrimitiveCell<T>, value: T) -> &mut Self {
        let def = Rc::clone(&cell.def);
        let target = Rc::clone(&def);
        let write = move |store: &Store| {
            store
                .write_cell(&target, Box::new(SetAction::Value(value.clone())))
                .map(|_| ())
        };
        self.entries.retain(|entry| entry.def.id != def.id);
        self.entries.push(Entry {
            def,
            write: Rc::new(write),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// IDs of the cells in the snapshot, in insertion order.
    pub fn cells(&self) -> impl Iterator<Item = CellId> + '_ {
        self.entries.iter().map(|entry| entry.def.id)
    }
}

impl Clone for Entry {
    fn clone(&self) -> Self {
        Self {
            def: Rc::clone(&self.def),
            write: Rc::clone(&self.write),
        }
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.cells()).finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::WritableCell;
    use std::cell::Cell as Counter;

    #[test]
    fn test_mounted_cells_lists_edges() {
        let store = Store::new();
        let count = WritableCell::primitive(1).with_label("count");
        let c = count.clone();
        let doubled = Cell::derived(move |get| Ok(get.get(&c)? * 2)).with_label("doubled");
        let _sub = store.sub(&doubled, || {}).unwrap();

        let cells = store.mounted_cells();
        assert_eq!(cells.len(), 2);
        let info = cells.iter().find(|i| i.id == doubled.id()).unwrap();
        assert_eq!(info.label.as_deref(), Some("doubled"));
        assert_eq!(info.dependencies, vec![count.id()]);
        assert_eq!(info.listeners, 1);
        assert_eq!(info.status, Status::Value);

        let json = serde_json::to_value(info).unwrap();
        assert_eq!(json["status"], "Value");
    }

    #[test]
    fn test_private_cells_are_hidden() {
        let store = Store::new();
        let hidden = WritableCell::primitive(0).private();
        let _sub = store.sub(&hidden, || {}).unwrap();
        assert!(store.mounted_cells().is_empty());
    }

    #[test]
    fn test_restore_notifies_once() {
        let store = Store::new();
        let a = WritableCell::primitive(0);
        let b = WritableCell::primitive(0);
        let (ca, cb) = (a.clone(), b.clone());
        let sum = Cell::derived(move |get| Ok(get.get(&ca)? + get.get(&cb)?));

        let calls = Rc::new(Counter::new(0));
        let n = Rc::clone(&calls);
        let _sub = store.sub(&sum, move || n.set(n.get() + 1)).unwrap();

        let mut snapshot = Snapshot::new();
        snapshot.insert(&a, 1).insert(&b, 2);
        store.restore(&snapshot).unwrap();

        assert_eq!(store.get(&sum).unwrap(), 3);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_snapshot_roundtrip_between_stores() {
        let count = WritableCell::primitive(0);
        let source = Store::new();
        source.set(&count, 9).unwrap();

        let snapshot = source.snapshot(&[&count]).unwrap();
        assert_eq!(snapshot.len(), 1);

        let target = Store::new();
        target.restore(&snapshot).unwrap();
        assert_eq!(target.get(&count).unwrap(), 9);
    }
}
