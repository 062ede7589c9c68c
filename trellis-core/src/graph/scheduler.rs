//! Update Scheduler
//!
//! The graph table owned by a store, and the two walks that run over it
//! after a write:
//!
//! 1. Invalidation: from a changed cell, mark every mounted dependent
//!    (transitively) as invalidated at its current revision.
//! 2. Ordering: collect the invalidated cells reachable from the changed
//!    set and sort them topologically, so a cell is recomputed only after
//!    all of its changed dependencies.
//!
//! Nothing here calls user code. The store drives recomputation with the
//! order this module produces.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use indexmap::IndexSet;

use super::node::{CellState, Mounted};
use crate::reactive::{CellDef, CellId, EffectMode, EffectRuntime, OnUnmount};

/// Deferred work collected during a transaction and run at flush.
pub(crate) enum Callback {
    Listener(Rc<dyn Fn()>),
    Mount(Rc<CellDef>),
    Unmount(OnUnmount),
    UnmountEffect(Rc<CellDef>),
}

/// All per-store graph data.
#[derive(Default)]
pub(crate) struct Graph {
    /// State of every cell touched by the store.
    pub(crate) states: HashMap<CellId, CellState>,
    /// Mount records; a cell is mounted iff it has one.
    pub(crate) mounted: HashMap<CellId, Mounted>,
    /// Cells marked stale, with the revision they were marked at.
    pub(crate) invalidated: HashMap<CellId, u64>,
    /// Cells whose revision changed since the last flush.
    pub(crate) changed: IndexSet<CellId>,
    pub(crate) mount_callbacks: Vec<Callback>,
    pub(crate) unmount_callbacks: Vec<Callback>,
    /// Per-store effect state, keyed by effect cell.
    pub(crate) effects: HashMap<CellId, Rc<EffectRuntime>>,
    pub(crate) immediate_effects: IndexSet<CellId>,
    pub(crate) deferred_effects: IndexSet<CellId>,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_mounted(&self, id: CellId) -> bool {
        self.mounted.contains_key(&id)
    }

    /// Whether `id` is invalidated at its current revision.
    pub(crate) fn is_invalidated(&self, id: CellId) -> bool {
        match (self.invalidated.get(&id), self.states.get(&id)) {
            (Some(at), Some(state)) => *at == state.revision(),
            _ => false,
        }
    }

    pub(crate) fn revision(&self, id: CellId) -> Option<u64> {
        self.states.get(&id).map(CellState::revision)
    }

    /// Mounted dependents of `id` that are themselves mounted.
    fn mounted_dependents(&self, id: CellId) -> Vec<CellId> {
        self.mounted
            .get(&id)
            .map(|m| {
                m.dependents
                    .iter()
                    .copied()
                    .filter(|d| self.mounted.contains_key(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record a change and invalidate everything mounted downstream of it.
    pub(crate) fn mark_changed(&mut self, id: CellId) {
        self.changed.insert(id);
        self.invalidate_dependents(id);
    }

    /// Mark every mounted transitive dependent of `id` as invalidated.
    pub(crate) fn invalidate_dependents(&mut self, id: CellId) {
        let mut stack = vec![id];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            for dependent in self.mounted_dependents(current) {
                if !visited.insert(dependent) {
                    continue;
                }
                if let Some(revision) = self.revision(dependent) {
                    self.invalidated.insert(dependent, revision);
                }
                stack.push(dependent);
            }
        }
    }

    /// Invalidated cells reachable from the changed set, dependencies first.
    pub(crate) fn affected_in_order(&self) -> Vec<Rc<CellDef>> {
        let mut to_process = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<CellId> = self.changed.iter().copied().collect();

        // BFS over mounted dependents
        while let Some(id) = queue.pop_front() {
            for dependent in self.mounted_dependents(id) {
                if visited.insert(dependent) {
                    if self.is_invalidated(dependent) {
                        to_process.push(dependent);
                    }
                    queue.push_back(dependent);
                }
            }
        }

        self.topological_sort(to_process)
            .into_iter()
            .filter_map(|id| self.mounted.get(&id).map(|m| Rc::clone(&m.def)))
            .collect()
    }

    /// Sort `nodes` so that dependencies come before dependents.
    ///
    /// Only edges inside the node set count. Nodes on a cycle are dropped.
    fn topological_sort(&self, nodes: Vec<CellId>) -> Vec<CellId> {
        let node_set: HashSet<_> = nodes.iter().copied().collect();
        let mut in_degree: HashMap<CellId, usize> = HashMap::new();
        let mut result = Vec::with_capacity(nodes.len());
        let mut queue = VecDeque::new();

        for &id in &nodes {
            let degree = self
                .mounted
                .get(&id)
                .map(|m| {
                    m.dependencies
                        .iter()
                        .filter(|d| **d != id && node_set.contains(d))
                        .count()
                })
                .unwrap_or(0);
            in_degree.insert(id, degree);
            if degree == 0 {
                queue.push_back(id);
            }
        }

        // Kahn's algorithm
        while let Some(id) = queue.pop_front() {
            result.push(id);
            if let Some(m) = self.mounted.get(&id) {
                for dependent in &m.dependents {
                    if *dependent == id {
                        continue;
                    }
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }
        }

        result
    }

    /// Take the callbacks for one flush round: listeners of changed
    /// mounted cells, then unmount hooks, then mount hooks.
    pub(crate) fn take_callbacks(&mut self) -> Vec<Callback> {
        let mut listeners = indexmap::IndexMap::new();
        for id in self.changed.drain(..) {
            if let Some(m) = self.mounted.get(&id) {
                for (listener_id, listener) in &m.listeners {
                    listeners
                        .entry(*listener_id)
                        .or_insert_with(|| Rc::clone(listener));
                }
            }
        }
        let mut callbacks: Vec<Callback> = listeners.into_values().map(Callback::Listener).collect();
        callbacks.append(&mut self.unmount_callbacks);
        callbacks.append(&mut self.mount_callbacks);
        callbacks
    }

    pub(crate) fn effect_queue(&mut self, mode: EffectMode) -> &mut IndexSet<CellId> {
        match mode {
            EffectMode::Immediate => &mut self.immediate_effects,
            EffectMode::Deferred => &mut self.deferred_effects,
        }
    }

    /// Pop the next queued effect of `mode` that is still mounted.
    pub(crate) fn pop_effect(&mut self, mode: EffectMode) -> Option<Rc<CellDef>> {
        while let Some(id) = self.effect_queue(mode).shift_remove_index(0) {
            if let Some(m) = self.mounted.get(&id) {
                return Some(Rc::clone(&m.def));
            }
        }
        None
    }

    /// Remove the states of unmounted cells whose handles are all gone.
    ///
    /// A removed state still holds its dependencies' definitions, so the
    /// caller drops the returned states outside any borrow of the graph and
    /// sweeps again until nothing is removed.
    pub(crate) fn sweep_orphans(&mut self) -> Vec<CellState> {
        let orphans: Vec<CellId> = self
            .states
            .iter()
            .filter(|(id, state)| state.is_orphaned() && !self.mounted.contains_key(id))
            .map(|(id, _)| *id)
            .collect();
        orphans
            .into_iter()
            .filter_map(|id| {
                self.invalidated.remove(&id);
                self.effects.remove(&id);
                self.states.remove(&id)
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Cell, WritableCell};

    /// Insert a mounted cell depending on `deps`.
    fn mount(graph: &mut Graph, def: &Rc<CellDef>, deps: &[CellId]) {
        graph.states.insert(def.id, CellState::new(def));
        graph
            .mounted
            .insert(def.id, Mounted::new(Rc::clone(def), deps.iter().copied().collect()));
        for dep in deps {
            if let Some(m) = graph.mounted.get_mut(dep) {
                m.dependents.insert(def.id);
            }
        }
    }

    #[test]
    fn test_invalidation_reaches_transitive_dependents() {
        let mut graph = Graph::new();
        let a = WritableCell::primitive(0);
        let b = Cell::derived(|_| Ok(0));
        let c = Cell::derived(|_| Ok(0));

        mount(&mut graph, &a.def, &[]);
        mount(&mut graph, &b.def, &[a.id()]);
        mount(&mut graph, &c.def, &[b.id()]);

        graph.mark_changed(a.id());

        assert!(!graph.is_invalidated(a.id()));
        assert!(graph.is_invalidated(b.id()));
        assert!(graph.is_invalidated(c.id()));
    }

    #[test]
    fn test_topological_order() {
        let mut graph = Graph::new();

        // Diamond: a -> b, a -> c, b -> d, c -> d
        let a = WritableCell::primitive(0);
        let b = Cell::derived(|_| Ok(0));
        let c = Cell::derived(|_| Ok(0));
        let d = Cell::derived(|_| Ok(0));

        mount(&mut graph, &a.def, &[]);
        mount(&mut graph, &b.def, &[a.id()]);
        mount(&mut graph, &c.def, &[a.id()]);
        mount(&mut graph, &d.def, &[b.id(), c.id()]);

        graph.mark_changed(a.id());
        let order: Vec<CellId> = graph.affected_in_order().iter().map(|def| def.id).collect();

        assert_eq!(order.len(), 3);
        let position = |id| order.iter().position(|x| *x == id).unwrap();
        assert!(position(b.id()) < position(d.id()));
        assert!(position(c.id()) < position(d.id()));
    }

    #[test]
    fn test_revalidated_cells_are_skipped() {
        let mut graph = Graph::new();
        let a = WritableCell::primitive(0);
        let b = Cell::derived(|_| Ok(0));

        mount(&mut graph, &a.def, &[]);
        mount(&mut graph, &b.def, &[a.id()]);

        graph.mark_changed(a.id());
        graph.invalidated.remove(&b.id());

        assert!(graph.affected_in_order().is_empty());
    }

    #[test]
    fn test_listeners_are_deduplicated_per_flush() {
        let mut graph = Graph::new();
        let a = WritableCell::primitive(0);
        mount(&mut graph, &a.def, &[]);

        let listener: Rc<dyn Fn()> = Rc::new(|| {});
        let id = crate::reactive::subscriber::ListenerId::new();
        if let Some(m) = graph.mounted.get_mut(&a.id()) {
            m.listeners.insert(id, listener);
        }

        graph.changed.insert(a.id());
        graph.changed.insert(a.id());

        assert_eq!(graph.take_callbacks().len(), 1);
        assert!(graph.take_callbacks().is_empty());
    }

    #[test]
    fn test_sweep_removes_dropped_cells() {
        let mut graph = Graph::new();
        let kept = WritableCell::primitive(0);
        {
            let dropped = Cell::derived(|_| Ok(1));
            graph.states.insert(dropped.id(), CellState::new(&dropped.def));
        }
        graph.states.insert(kept.id(), CellState::new(&kept.def));

        let removed = graph.sweep_orphans();
        assert_eq!(removed.len(), 1);
        assert_eq!(graph.states.len(), 1);
        assert!(graph.states.contains_key(&kept.id()));
    }
}
