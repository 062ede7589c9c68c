//! Mount Registry
//!
//! A cell is mounted while something outside the graph needs it kept up to
//! date: a listener subscribed to it, or a mounted cell depends on it.
//! Mounted cells carry reverse edges, so writes push invalidation into
//! them and they are recomputed before the write returns. Unmounted cells
//! have no reverse edges and revalidate lazily on the next read.
//!
//! Mount hooks are not run here. Mounting pushes a callback that the next
//! flush runs, so a hook always sees a consistent graph and runs at most
//! once per mount.

use std::rc::Rc;

use indexmap::IndexSet;
use tracing::debug;

use super::cell::CellDef;
use super::runtime::Store;
use super::CellId;
use crate::error::Result;
use crate::graph::{Callback, Mounted};

impl Store {
    /// Mount a cell and, first, every cell it currently depends on.
    pub(crate) fn mount_cell(&self, def: &Rc<CellDef>) {
        let id = def.id;
        if self.inner.graph.borrow().is_mounted(id) {
            return;
        }
        self.read_state(def);

        let dependencies: Vec<Rc<CellDef>> = self
            .inner
            .graph
            .borrow()
            .states
            .get(&id)
            .map(|state| {
                state
                    .dependencies
                    .values()
                    .filter(|dep| dep.def.id != id)
                    .map(|dep| Rc::clone(&dep.def))
                    .collect()
            })
            .unwrap_or_default();
        for dependency in &dependencies {
            self.mount_cell(dependency);
        }

        let mut graph = self.inner.graph.borrow_mut();
        // A dependency's mount hook may not mount us, but a derivation may.
        if graph.is_mounted(id) {
            return;
        }
        let edges: IndexSet<CellId> = dependencies.iter().map(|dep| dep.id).collect();
        for dep in &edges {
            if let Some(mounted) = graph.mounted.get_mut(dep) {
                mounted.dependents.insert(id);
            }
        }
        graph.mounted.insert(id, Mounted::new(Rc::clone(def), edges));
        if def.is_effect() || def.has_mount_hook() {
            graph.mount_callbacks.push(Callback::Mount(Rc::clone(def)));
        }
        debug!(cell = %id, "mounted");
    }

    /// Unmount a cell if nothing holds it any more, then its dependencies.
    ///
    /// Returns whether the cell is still mounted.
    pub(crate) fn unmount_cell(&self, id: CellId) -> bool {
        let dependencies = {
            let mut graph = self.inner.graph.borrow_mut();
            let Some(mounted) = graph.mounted.get(&id) else {
                return false;
            };
            let held = !mounted.listeners.is_empty()
                || mounted
                    .dependents
                    .iter()
                    .any(|d| *d != id && graph.mounted.get(d).is_some_and(|m| m.dependencies.contains(&id)));
            if held {
                return true;
            }
            let Some(mounted) = graph.mounted.remove(&id) else {
                return false;
            };
            if mounted.def.is_effect() {
                graph
                    .unmount_callbacks
                    .push(Callback::UnmountEffect(Rc::clone(&mounted.def)));
            } else if let Some(on_unmount) = mounted.on_unmount {
                graph.unmount_callbacks.push(Callback::Unmount(on_unmount));
            }
            for dep in &mounted.dependencies {
                if let Some(dep_mounted) = graph.mounted.get_mut(dep) {
                    dep_mounted.dependents.shift_remove(&id);
                }
            }
            debug!(cell = %id, "unmounted");
            mounted.dependencies
        };
        for dep in dependencies {
            self.unmount_cell(dep);
        }
        false
    }

    /// Reconcile a mounted cell's edges with its latest dependency snapshot.
    ///
    /// New dependencies are mounted; edges to cells no longer read are
    /// retracted, which may unmount them.
    pub(crate) fn mount_dependencies(&self, def: &Rc<CellDef>) {
        let id = def.id;
        let (added, removed) = {
            let graph = self.inner.graph.borrow();
            let (Some(mounted), Some(state)) = (graph.mounted.get(&id), graph.states.get(&id)) else {
                return;
            };
            let added: Vec<(Rc<CellDef>, u64)> = state
                .dependencies
                .values()
                .filter(|dep| dep.def.id != id && !mounted.dependencies.contains(&dep.def.id))
                .map(|dep| (Rc::clone(&dep.def), dep.revision))
                .collect();
            let removed: Vec<CellId> = mounted
                .dependencies
                .iter()
                .copied()
                .filter(|dep| !state.dependencies.contains_key(dep))
                .collect();
            (added, removed)
        };

        for (dep, observed) in added {
            self.mount_cell(&dep);
            let mut graph = self.inner.graph.borrow_mut();
            if let Some(mounted) = graph.mounted.get_mut(&dep.id) {
                mounted.dependents.insert(id);
            }
            if let Some(mounted) = graph.mounted.get_mut(&id) {
                mounted.dependencies.insert(dep.id);
            }
            // Moved between our read and its mount.
            if graph.revision(dep.id).is_some_and(|current| current != observed) {
                graph.changed.insert(dep.id);
            }
        }

        for dep in removed {
            {
                let mut graph = self.inner.graph.borrow_mut();
                if let Some(mounted) = graph.mounted.get_mut(&id) {
                    mounted.dependencies.shift_remove(&dep);
                }
                if let Some(mounted) = graph.mounted.get_mut(&dep) {
                    mounted.dependents.shift_remove(&id);
                }
            }
            self.unmount_cell(dep);
        }
    }

    /// Run a cell's mount hook if the cell is still mounted.
    pub(crate) fn run_mount_hook(&self, def: &Rc<CellDef>) -> Result<()> {
        if !self.inner.graph.borrow().is_mounted(def.id) {
            return Ok(());
        }
        let Some(hook) = def.mount_hook() else {
            return Ok(());
        };
        debug!(cell = %def.id, "running mount hook");
        let Some(on_unmount) = hook(self, def)? else {
            return Ok(());
        };
        let mut graph = self.inner.graph.borrow_mut();
        match graph.mounted.get_mut(&def.id) {
            Some(mounted) => {
                mounted.on_unmount = Some(on_unmount);
                Ok(())
            }
            // Unmounted by the hook itself.
            None => {
                drop(graph);
                on_unmount()
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::reactive::{Cell, Store, WritableCell};
    use std::cell::Cell as Counter;
    use std::rc::Rc;

    #[test]
    fn test_mounting_mounts_dependencies() {
        let store = Store::new();
        let count = WritableCell::primitive(1);
        let c = count.clone();
        let doubled = Cell::derived(move |get| Ok(get.get(&c)? * 2));

        let sub = store.sub(&doubled, || {}).unwrap();
        assert!(store.is_mounted(&doubled));
        assert!(store.is_mounted(&count));

        drop(sub);
        assert!(!store.is_mounted(&doubled));
        assert!(!store.is_mounted(&count));
    }

    #[test]
    fn test_shared_dependency_stays_mounted() {
        let store = Store::new();
        let count = WritableCell::primitive(1);
        let (c1, c2) = (count.clone(), count.clone());
        let a = Cell::derived(move |get| get.get(&c1));
        let b = Cell::derived(move |get| get.get(&c2));

        let sub_a = store.sub(&a, || {}).unwrap();
        let sub_b = store.sub(&b, || {}).unwrap();
        sub_a.unsubscribe().unwrap();
        assert!(store.is_mounted(&count));

        sub_b.unsubscribe().unwrap();
        assert!(!store.is_mounted(&count));
    }

    #[test]
    fn test_mount_hook_runs_once_per_mount() {
        let store = Store::new();
        let mounts = Rc::new(Counter::new(0));
        let unmounts = Rc::new(Counter::new(0));

        let (m, u) = (Rc::clone(&mounts), Rc::clone(&unmounts));
        let count = WritableCell::primitive(0).with_on_mount(move |_set| {
            m.set(m.get() + 1);
            let u = Rc::clone(&u);
            let on_unmount: crate::reactive::OnUnmount = Box::new(move || {
                u.set(u.get() + 1);
                Ok(())
            });
            Ok(Some(on_unmount))
        });

        let first = store.sub(&count, || {}).unwrap();
        let second = store.sub(&count, || {}).unwrap();
        assert_eq!(mounts.get(), 1);

        drop(first);
        assert_eq!(unmounts.get(), 0);
        drop(second);
        assert_eq!(unmounts.get(), 1);

        let _third = store.sub(&count, || {}).unwrap();
        assert_eq!(mounts.get(), 2);
    }

    #[test]
    fn test_mount_hook_can_write_its_cell() {
        let store = Store::new();
        let count = WritableCell::primitive(0).with_on_mount(|set| {
            set.set(10)?;
            Ok(None)
        });
        let seen = Rc::new(Counter::new(0));
        let (s, c) = (Rc::clone(&seen), count.clone());
        let store2 = store.clone();
        let _sub = store
            .sub(&count, move || s.set(store2.get(&c).unwrap_or(-1)))
            .unwrap();

        assert_eq!(store.get(&count).unwrap(), 10);
        assert_eq!(seen.get(), 10);
    }
}
