//! Store Runtime
//!
//! The store owns every piece of mutable state: one [`CellState`] per cell it
//! has touched, the mount registry, the in-flight async set and the effect
//! queues. Cell definitions hold none of it, so one cell can live in many
//! stores at once.
//!
//! # How It Works
//!
//! 1. `get` pulls. A cached value is returned when the cell is mounted and
//!    not invalidated, or when every recorded dependency still has the
//!    revision it had when the cell was derived. Otherwise the cell is
//!    derived again and its dependency snapshot replaced.
//!
//! 2. `set` runs the write function. Leaf commits bump revisions and
//!    invalidate mounted dependents, but nothing is recomputed until the
//!    outermost write returns.
//!
//! 3. The transaction then ends: invalidated mounted cells are recomputed
//!    in dependency order, and one flush runs listeners, unmount and mount
//!    hooks, and effects, until nothing is left.
//!
//! # Threading
//!
//! A store is single threaded (`Rc` + `RefCell`). All user code runs with
//! no borrow of the graph held, so derivations, hooks and listeners may
//! call back into the store.

use std::any::Any;
use std::cell::{Cell as Flag, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use super::cell::{
    downcast, downcast_output, Cell, CellDef, CellId, CellValue, Derived, Read, Value, WritableCell,
};
use super::context::{Getter, ReadOptions};
use super::effect::EffectMode;
use super::inspect::Snapshot;
use super::pending::{PendingToken, TaskQueue};
use super::PrimitiveCell;
use crate::config::{DeferredFlush, StoreConfig};
use crate::error::{Error, Result};
use crate::graph::{Callback, CellState, Dependency, Displaced, Graph, Observation};

/// Shared store internals.
pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) graph: RefCell<Graph>,
    pub(crate) tasks: TaskQueue,
    /// Open effect runs; while non-zero, transactions do not end.
    pub(crate) batch_depth: Flag<usize>,
    flushing: Flag<bool>,
}

/// A container of cell states.
///
/// Cloning a store clones the handle; both handles see the same states.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Rc<StoreInner>,
}

impl Store {
    /// Create a store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create a store with the given configuration.
    pub fn with_config(config: StoreConfig) -> Self {
        debug!(store = config.display_label(), "store created");
        Self {
            inner: Rc::new(StoreInner {
                config,
                graph: RefCell::new(Graph::new()),
                tasks: TaskQueue::default(),
                batch_depth: Flag::new(0),
                flushing: Flag::new(false),
            }),
        }
    }

    /// Start building a store with initial values.
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    pub(crate) fn from_inner(inner: Rc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Read a cell.
    ///
    /// Returns the stored error if the cell's derivation failed, and
    /// [`Error::Pending`] while it waits for an async result.
    pub fn get<T: CellValue>(&self, cell: &Cell<T>) -> Result<T> {
        self.get_untracked(&cell.def)
    }

    /// Write a cell and run the resulting transaction.
    ///
    /// Errors from the write function take precedence over errors raised by
    /// listeners and hooks during the flush. Writes made before a write
    /// function failed stay committed and are flushed.
    pub fn set<T, A, R>(&self, cell: &WritableCell<T, A, R>, arg: impl Into<A>) -> Result<R>
    where
        A: 'static,
        R: 'static,
    {
        let output = self.set_erased(&cell.def, Box::new(arg.into()))?;
        downcast_output(cell.id(), output)
    }

    /// Whether the cell is mounted in this store.
    pub fn is_mounted<T>(&self, cell: &Cell<T>) -> bool {
        self.inner.graph.borrow().is_mounted(cell.id())
    }

    /// Drop the states of cells whose handles are all gone.
    ///
    /// Returns the number of states removed.
    pub fn collect_garbage(&self) -> usize {
        let mut count = 0;
        loop {
            let removed = self.inner.graph.borrow_mut().sweep_orphans();
            if removed.is_empty() {
                break;
            }
            count += removed.len();
            // Dropped here, with the graph released.
            drop(removed);
        }
        count
    }

    // ------------------------------------------------------------------------
    // Evaluator
    // ------------------------------------------------------------------------

    pub(crate) fn get_untracked<T: CellValue>(&self, def: &Rc<CellDef>) -> Result<T> {
        let value = self.read_state(def).outcome?;
        downcast(def.id, &value)
    }

    /// Bring a cell up to date and observe it.
    pub(crate) fn read_state(&self, def: &Rc<CellDef>) -> Observation {
        let id = def.id;
        if matches!(def.read, Read::Lazy(_)) && !self.inner.graph.borrow().states.contains_key(&id) {
            // The initializer runs with the graph released.
            let state = CellState::new(def);
            self.inner.graph.borrow_mut().states.entry(id).or_insert(state);
        }
        let dependencies = {
            let mut graph = self.inner.graph.borrow_mut();
            let cached = graph.is_mounted(id) && !graph.is_invalidated(id);
            let state = graph
                .states
                .entry(id)
                .or_insert_with(|| CellState::new(def));
            if !matches!(def.read, Read::Derive(_)) {
                return state.observe(id);
            }
            if state.is_initialized() && cached {
                trace!(cell = %id, "mounted cache hit");
                return state.observe(id);
            }
            if state.is_initialized() {
                Some(state.dependencies.values().cloned().collect::<Vec<_>>())
            } else {
                None
            }
        };

        if let Some(dependencies) = dependencies {
            if self.dependencies_fresh(id, &dependencies) {
                let mut graph = self.inner.graph.borrow_mut();
                graph.invalidated.remove(&id);
                if let Some(state) = graph.states.get(&id) {
                    trace!(cell = %id, "dependencies unchanged");
                    return state.observe(id);
                }
            }
        }

        self.derive(def)
    }

    /// Whether every dependency still has the revision it had when read.
    fn dependencies_fresh(&self, id: CellId, dependencies: &[Dependency]) -> bool {
        dependencies
            .iter()
            .all(|dep| dep.def.id == id || self.read_state(&dep.def).revision == dep.revision)
    }

    fn recorded_dependencies(&self, id: CellId) -> Vec<Dependency> {
        self.inner
            .graph
            .borrow()
            .states
            .get(&id)
            .map(|state| state.dependencies.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Compare a candidate value with the committed one, graph released.
    fn equals_current(&self, def: &CellDef, value: &Value) -> bool {
        let current = self
            .inner
            .graph
            .borrow()
            .states
            .get(&def.id)
            .and_then(|state| state.last_value().cloned());
        current.is_some_and(|current| (def.eq)(&*current, &**value))
    }

    /// Run a derivation and commit its outcome.
    fn derive(&self, def: &Rc<CellDef>) -> Observation {
        let id = def.id;
        let Read::Derive(read) = &def.read else {
            return Observation {
                revision: 0,
                outcome: Err(Error::Invariant(format!("{id} has no derivation"))),
            };
        };
        trace!(cell = %id, "recomputing");

        let getter = Getter::new(self, def);
        let options = ReadOptions::new(self, def);
        let outcome = read(&getter, &options);
        let dependencies = getter.into_dependencies();
        let token = options.finish();
        let equal = match &outcome {
            Ok(Derived::Ready(value)) => self.equals_current(def, value),
            _ => false,
        };

        let mut spawn = None;
        let (observation, displaced, retracted, mounted) = {
            let mut graph = self.inner.graph.borrow_mut();
            let mounted = graph.is_mounted(id);
            let state = graph
                .states
                .entry(id)
                .or_insert_with(|| CellState::new(def));
            let previous = state.revision();
            let retracted = std::mem::replace(&mut state.dependencies, dependencies);
            let displaced = match outcome {
                Ok(Derived::Ready(value)) => state.set_value(value, equal),
                Ok(Derived::Pending(future)) => {
                    let token = token.unwrap_or_else(PendingToken::new);
                    spawn = Some((token.clone(), future));
                    state.set_pending(token)
                }
                Err(Error::Pending(dependency)) => {
                    if state.pending().is_some_and(PendingToken::is_waiting) {
                        Displaced::default()
                    } else {
                        trace!(cell = %id, waiting_on = %dependency, "pending on dependency");
                        state.set_pending(PendingToken::waiting())
                    }
                }
                Err(error) => state.set_error(error),
            };
            let changed = state.revision() != previous;
            let observation = state.observe(id);
            graph.invalidated.remove(&id);
            if changed && mounted {
                graph.changed.insert(id);
            }
            (observation, displaced, retracted, mounted)
        };

        if let Some(token) = &displaced.token {
            token.abort();
        }
        drop(displaced);
        drop(retracted);
        if let Some((token, future)) = spawn {
            self.inner.tasks.spawn(Rc::clone(def), token, future);
        }
        if mounted {
            self.mount_dependencies(def);
        }
        observation
    }

    // ------------------------------------------------------------------------
    // Mutator
    // ------------------------------------------------------------------------

    /// Write a cell as one full transaction.
    pub(crate) fn set_erased(&self, def: &Rc<CellDef>, arg: Box<dyn Any>) -> Result<Box<dyn Any>> {
        let written = self.write_cell(def, arg);
        let flushed = self.end_transaction();
        let output = written?;
        flushed?;
        Ok(output)
    }

    /// Run a write function without ending the transaction.
    pub(crate) fn write_cell(&self, def: &Rc<CellDef>, arg: Box<dyn Any>) -> Result<Box<dyn Any>> {
        match &def.write {
            Some(write) => write(self, def, arg),
            None => Err(Error::NotWritable(def.id)),
        }
    }

    /// Commit a new backing value and invalidate mounted dependents.
    pub(crate) fn commit_source(&self, def: &Rc<CellDef>, value: Value) {
        let id = def.id;
        let equal = match self.read_state(def).outcome {
            Ok(current) => (def.eq)(&*current, &*value),
            Err(_) => false,
        };
        let mut graph = self.inner.graph.borrow_mut();
        let state = graph
            .states
            .entry(id)
            .or_insert_with(|| CellState::new(def));
        let previous = state.revision();
        let displaced = state.set_value(value, equal);
        if state.revision() != previous {
            trace!(cell = %id, revision = previous + 1, "committed");
            graph.mark_changed(id);
        }
        drop(graph);
        drop(displaced);
    }

    /// Finish a transaction unless an effect run is batching it.
    pub(crate) fn end_transaction(&self) -> Result<()> {
        if self.inner.batch_depth.get() > 0 {
            return Ok(());
        }
        self.recompute_invalidated();
        self.flush()
    }

    /// Recompute invalidated mounted cells, dependencies first.
    ///
    /// Effect cells are queued instead of run, and only when one of the
    /// cells they read has moved.
    pub(crate) fn recompute_invalidated(&self) {
        let order = self.inner.graph.borrow().affected_in_order();
        for def in order {
            if !self.inner.graph.borrow().is_invalidated(def.id) {
                continue;
            }
            if !def.is_effect() {
                self.read_state(&def);
                continue;
            }
            let dependencies = self.recorded_dependencies(def.id);
            if self.dependencies_fresh(def.id, &dependencies) {
                trace!(cell = %def.id, "effect dependencies unchanged");
                self.inner.graph.borrow_mut().invalidated.remove(&def.id);
            } else {
                self.schedule_effect(&def);
            }
        }
    }

    /// Run immediate effects queued so far, outside of any effect batch.
    pub(crate) fn settle_immediate(&self) -> Result<()> {
        if self.inner.batch_depth.get() > 0 {
            return Ok(());
        }
        self.recompute_invalidated();
        self.run_queued_effects(EffectMode::Immediate)
    }

    // ------------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------------

    /// Run callbacks until the store is quiet.
    ///
    /// Reentrant calls return at once; the outermost flush picks up their
    /// work. Every callback runs even if an earlier one failed.
    pub(crate) fn flush(&self) -> Result<()> {
        if self.inner.flushing.replace(true) {
            return Ok(());
        }
        let _guard = FlushGuard(&self.inner.flushing);
        let mut errors = Vec::new();
        loop {
            self.recompute_invalidated();
            if let Err(error) = self.run_queued_effects(EffectMode::Immediate) {
                errors.push(error);
            }
            let callbacks = self.inner.graph.borrow_mut().take_callbacks();
            if callbacks.is_empty() {
                let graph = self.inner.graph.borrow();
                let immediate = !graph.immediate_effects.is_empty();
                let deferred = self.inner.config.deferred_flush == DeferredFlush::EndOfFlush
                    && !graph.deferred_effects.is_empty();
                drop(graph);
                if immediate {
                    continue;
                }
                if deferred {
                    if let Err(error) = self.run_queued_effects(EffectMode::Deferred) {
                        errors.push(error);
                    }
                    continue;
                }
                break;
            }
            for callback in callbacks {
                if let Err(error) = self.run_callback(callback) {
                    errors.push(error);
                }
            }
        }
        Error::collect(errors)
    }

    fn run_callback(&self, callback: Callback) -> Result<()> {
        match callback {
            Callback::Listener(listener) => {
                listener();
                Ok(())
            }
            Callback::Mount(def) if def.is_effect() => self.mount_effect(&def),
            Callback::Mount(def) => self.run_mount_hook(&def),
            Callback::Unmount(on_unmount) => on_unmount(),
            Callback::UnmountEffect(def) => self.unmount_effect(&def),
        }
    }

    /// Run deferred effects now.
    ///
    /// With [`DeferredFlush::Manual`], deferred effects only run when the
    /// host calls this. With the default configuration it is only needed
    /// for effects queued outside of a flush.
    pub fn flush_deferred(&self) -> Result<()> {
        let ran = self.run_queued_effects(EffectMode::Deferred);
        let flushed = self.end_transaction();
        ran?;
        flushed
    }

    fn run_queued_effects(&self, mode: EffectMode) -> Result<()> {
        let mut errors = Vec::new();
        loop {
            let next = self.inner.graph.borrow_mut().pop_effect(mode);
            let Some(def) = next else { break };
            if let Err(error) = self.run_effect(&def) {
                errors.push(error);
            }
            self.recompute_invalidated();
        }
        Error::collect(errors)
    }
}

/// Clears the flushing flag even if a callback panics.
struct FlushGuard<'a>(&'a Flag<bool>);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let graph = self.inner.graph.try_borrow();
        let mut debug = f.debug_struct("Store");
        debug.field("label", &self.inner.config.display_label());
        if let Ok(graph) = graph {
            debug
                .field("states", &graph.states.len())
                .field("mounted", &graph.mounted.len());
        }
        debug.field("in_flight", &self.inner.tasks.len()).finish()
    }
}

/// Builder for a [`Store`] with initial values.
#[derive(Default)]
pub struct StoreBuilder {
    config: StoreConfig,
    initial: Snapshot,
}

impl StoreBuilder {
    /// Use the given configuration.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Give a primitive cell an initial value in the new store.
    pub fn value<T: CellValue>(mut self, cell: &PrimitiveCell<T>, value: T) -> Self {
        self.initial.insert(cell, value);
        self
    }

    /// Build the store, writing the initial values through `set`.
    pub fn build(self) -> Result<Store> {
        let store = Store::with_config(self.config);
        store.restore(&self.initial)?;
        Ok(store)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
