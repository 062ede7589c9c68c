//! Effect Cells
//!
//! An effect cell runs a side-effecting function whenever the cells it read
//! on its last run change, for as long as it is mounted.
//!
//! # How Effects Work
//!
//! 1. Mounting the cell (subscribing to it, or mounting a cell that reads
//!    it) queues the first run.
//!
//! 2. A write to a dependency invalidates the effect like any mounted
//!    cell. Instead of being recomputed in place it is queued, so several
//!    writes in one transaction cause one rerun.
//!
//! 3. Before each rerun, and once on unmount, the cleanup returned by the
//!    previous run is called.
//!
//! # Variants
//!
//! - [`sync_effect`] runs inside the transaction that triggered it, before
//!   listeners are notified. Its writes are visible to later reads in the
//!   same write function.
//! - [`effect`] runs after the listeners of the triggering flush, or when
//!   the host calls [`Store::flush_deferred`] if the store is configured
//!   with [`DeferredFlush::Manual`](crate::config::DeferredFlush::Manual).
//!
//! # Writes from effects
//!
//! Ordinary writes made with [`EffectSetter::set`] are batched until the
//! run returns, and do not retrigger the effect that made them. A write
//! made with [`EffectSetter::recurse`] reruns the effect before `recurse`
//! returns, if one of the effect's dependencies actually changed. Nested
//! reruns are trampolined: a `recurse` inside a rerun only requests
//! another pass, so the stack stays flat however deep the recursion goes.
//! There is no iteration cap; an effect that always changes its own
//! dependency does not terminate.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{debug, trace};

use super::cell::{downcast, downcast_output, Cell, CellDef, CellValue, Read, WritableCell};
use super::runtime::Store;
use super::CellId;
use crate::error::{Error, Result};
use crate::graph::Dependency;

/// When an effect runs relative to listener notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EffectMode {
    Immediate,
    Deferred,
}

type EffectFn = dyn Fn(&EffectGetter<'_>, &EffectSetter<'_>) -> Result<Option<Cleanup>>;

/// Definition-side part of an effect cell.
pub(crate) struct EffectCore {
    pub(crate) mode: EffectMode,
    run: Box<EffectFn>,
}

/// Returned by an effect run; called before the next run and on unmount.
///
/// The cleanup may write cells, but may not call
/// [`recurse`](EffectSetter::recurse).
pub struct Cleanup(Box<dyn FnOnce(&EffectSetter<'_>) -> Result<()>>);

impl Cleanup {
    /// Create a cleanup that can write cells.
    pub fn new(cleanup: impl FnOnce(&EffectSetter<'_>) -> Result<()> + 'static) -> Self {
        Self(Box::new(cleanup))
    }

    /// Create a cleanup that only runs host code.
    pub fn from_fn(cleanup: impl FnOnce() + 'static) -> Self {
        Self::new(move |_| {
            cleanup();
            Ok(())
        })
    }
}

/// Create a deferred effect cell.
///
/// ```rust,ignore
/// let count = WritableCell::primitive(0);
/// let c = count.clone();
/// let log = effect(move |get, _set| {
///     println!("count is {}", get.get(&c)?);
///     Ok(None)
/// });
/// let _sub = store.sub(&log, || {})?;
/// ```
pub fn effect<F>(run: F) -> Cell<()>
where
    F: Fn(&EffectGetter<'_>, &EffectSetter<'_>) -> Result<Option<Cleanup>> + 'static,
{
    build(EffectMode::Deferred, Box::new(run))
}

/// Create an effect cell that runs inside the triggering transaction.
pub fn sync_effect<F>(run: F) -> Cell<()>
where
    F: Fn(&EffectGetter<'_>, &EffectSetter<'_>) -> Result<Option<Cleanup>> + 'static,
{
    build(EffectMode::Immediate, Box::new(run))
}

fn build(mode: EffectMode, run: Box<EffectFn>) -> Cell<()> {
    let core = EffectCore { mode, run };
    Cell::from_def(CellDef::new::<()>(Read::Effect(Rc::new(core)), None))
}

fn core_of(def: &CellDef) -> Result<&Rc<EffectCore>> {
    match &def.read {
        Read::Effect(core) => Ok(core),
        _ => Err(Error::Invariant(format!("{} is not an effect", def.id))),
    }
}

/// Per-store state of one effect cell.
#[derive(Default)]
pub(crate) struct EffectRuntime {
    state: RefCell<EffectState>,
}

#[derive(Default)]
struct EffectState {
    mounted: bool,
    /// Runs currently on the stack.
    in_progress: usize,
    /// A cleanup is running.
    from_cleanup: bool,
    /// Bumped by every run and by unmount; a run whose generation moved
    /// while it executed is stale.
    generation: u64,
    cleanup: Option<Cleanup>,
    /// A `recurse` is driving reruns.
    trampolining: bool,
    rerun_requested: bool,
    runs: u64,
    /// Cells read by the run in progress.
    reads: IndexMap<CellId, Dependency>,
}

impl EffectRuntime {
    pub(crate) fn runs(&self) -> u64 {
        self.state.borrow().runs
    }
}

/// Tracking reader passed to effects.
pub struct EffectGetter<'a> {
    store: &'a Store,
    def: &'a Rc<CellDef>,
    runtime: &'a Rc<EffectRuntime>,
}

impl EffectGetter<'_> {
    /// Read a cell and record it as a dependency of the effect.
    pub fn get<T: CellValue>(&self, cell: &Cell<T>) -> Result<T> {
        if cell.id() == self.def.id {
            return Err(Error::SelfRead(self.def.id));
        }
        let observation = self.store.read_state(&cell.def);
        self.runtime.state.borrow_mut().reads.insert(
            cell.id(),
            Dependency {
                def: Rc::clone(&cell.def),
                revision: observation.revision,
            },
        );
        downcast(cell.id(), &observation.outcome?)
    }

    /// Read a cell without depending on it.
    pub fn peek<T: CellValue>(&self, cell: &Cell<T>) -> Result<T> {
        self.store.get_untracked(&cell.def)
    }
}

/// Writer passed to effects and their cleanups.
pub struct EffectSetter<'a> {
    store: &'a Store,
    def: &'a Rc<CellDef>,
    runtime: &'a Rc<EffectRuntime>,
}

impl EffectSetter<'_> {
    /// Read a cell without depending on it.
    pub fn get<T: CellValue>(&self, cell: &Cell<T>) -> Result<T> {
        self.store.get_untracked(&cell.def)
    }

    /// Write a cell. Dependents see the write once the run returns.
    pub fn set<T, A, R>(&self, target: &WritableCell<T, A, R>, arg: impl Into<A>) -> Result<R>
    where
        A: 'static,
        R: 'static,
    {
        let output = self.store.write_cell(&target.def, Box::new(arg.into()))?;
        downcast_output(target.id(), output)
    }

    /// Write a cell and rerun this effect if its dependencies changed.
    ///
    /// Fails with [`Error::RecurseInCleanup`] when called from a cleanup.
    pub fn recurse<T, A, R>(&self, target: &WritableCell<T, A, R>, arg: impl Into<A>) -> Result<R>
    where
        A: 'static,
        R: 'static,
    {
        if self.runtime.state.borrow().from_cleanup {
            return Err(Error::RecurseInCleanup);
        }
        let output = self.store.write_cell(&target.def, Box::new(arg.into()))?;
        if self.reads_changed() {
            let drive = {
                let mut state = self.runtime.state.borrow_mut();
                if state.trampolining {
                    state.rerun_requested = true;
                    false
                } else {
                    state.trampolining = true;
                    true
                }
            };
            if drive {
                let result = self.trampoline();
                self.runtime.state.borrow_mut().trampolining = false;
                result?;
            }
        }
        downcast_output(target.id(), output)
    }

    /// Whether a cell read by the current run has moved since it was read.
    fn reads_changed(&self) -> bool {
        let reads: Vec<Dependency> = self.runtime.state.borrow().reads.values().cloned().collect();
        reads
            .iter()
            .any(|dep| self.store.read_state(&dep.def).revision != dep.revision)
    }

    fn trampoline(&self) -> Result<()> {
        loop {
            self.runtime.state.borrow_mut().rerun_requested = false;
            self.store.run_effect_once(self.def, self.runtime)?;
            if !self.runtime.state.borrow().rerun_requested {
                return Ok(());
            }
        }
    }
}

impl Store {
    fn effect_runtime(&self, def: &Rc<CellDef>) -> Rc<EffectRuntime> {
        let mut graph = self.inner.graph.borrow_mut();
        Rc::clone(graph.effects.entry(def.id).or_default())
    }

    /// Number of times an effect has run in this store.
    pub fn effect_runs(&self, effect: &Cell<()>) -> u64 {
        self.inner
            .graph
            .borrow()
            .effects
            .get(&effect.id())
            .map_or(0, |runtime| runtime.runs())
    }

    /// Queue an invalidated effect, unless it is the one writing.
    pub(crate) fn schedule_effect(&self, def: &Rc<CellDef>) {
        let runtime = self.effect_runtime(def);
        let mut graph = self.inner.graph.borrow_mut();
        graph.invalidated.remove(&def.id);
        if runtime.state.borrow().in_progress > 0 {
            trace!(cell = %def.id, "write from running effect absorbed");
            return;
        }
        if let Ok(core) = core_of(def) {
            graph.effect_queue(core.mode).insert(def.id);
        }
    }

    /// Queue the first run of a newly mounted effect.
    pub(crate) fn mount_effect(&self, def: &Rc<CellDef>) -> Result<()> {
        let mode = core_of(def)?.mode;
        let runtime = self.effect_runtime(def);
        let mut graph = self.inner.graph.borrow_mut();
        if !graph.is_mounted(def.id) {
            return Ok(());
        }
        runtime.state.borrow_mut().mounted = true;
        graph.effect_queue(mode).insert(def.id);
        Ok(())
    }

    /// Stop an effect and run its last cleanup.
    pub(crate) fn unmount_effect(&self, def: &Rc<CellDef>) -> Result<()> {
        let runtime = self.effect_runtime(def);
        let cleanup = {
            let mut state = runtime.state.borrow_mut();
            state.mounted = false;
            state.generation += 1;
            state.cleanup.take()
        };
        {
            let mut graph = self.inner.graph.borrow_mut();
            // Remounted before this callback ran.
            if graph.is_mounted(def.id) {
                runtime.state.borrow_mut().mounted = true;
            }
            graph.immediate_effects.shift_remove(&def.id);
            graph.deferred_effects.shift_remove(&def.id);
        }
        debug!(cell = %def.id, "effect unmounted");
        match cleanup {
            Some(cleanup) => self.run_cleanup(def, &runtime, cleanup),
            None => Ok(()),
        }
    }

    /// Run a queued effect.
    pub(crate) fn run_effect(&self, def: &Rc<CellDef>) -> Result<()> {
        let runtime = self.effect_runtime(def);
        {
            let state = runtime.state.borrow();
            if !state.mounted || state.in_progress > 0 {
                return Ok(());
            }
        }
        self.run_effect_once(def, &runtime)
    }

    /// Clean up the previous run, run once, and commit what was read.
    fn run_effect_once(&self, def: &Rc<CellDef>, runtime: &Rc<EffectRuntime>) -> Result<()> {
        let core = Rc::clone(core_of(def)?);
        let mut errors = Vec::new();

        let previous = runtime.state.borrow_mut().cleanup.take();
        if let Some(cleanup) = previous {
            if let Err(error) = self.run_cleanup(def, runtime, cleanup) {
                errors.push(error);
            }
        }

        let generation = {
            let mut state = runtime.state.borrow_mut();
            state.generation += 1;
            state.in_progress += 1;
            state.reads.clear();
            state.generation
        };
        self.inner.batch_depth.set(self.inner.batch_depth.get() + 1);
        let result = {
            let getter = EffectGetter {
                store: self,
                def,
                runtime,
            };
            let setter = EffectSetter {
                store: self,
                def,
                runtime,
            };
            (core.run)(&getter, &setter)
        };
        self.inner.batch_depth.set(self.inner.batch_depth.get() - 1);

        let (current, reads, runs) = {
            let mut state = runtime.state.borrow_mut();
            state.in_progress -= 1;
            state.runs += 1;
            let current = state.generation == generation && state.mounted;
            (current, std::mem::take(&mut state.reads), state.runs)
        };
        debug!(cell = %def.id, runs, current, "effect ran");

        match result {
            Ok(cleanup) if current => {
                self.commit_effect_reads(def, reads);
                runtime.state.borrow_mut().cleanup = cleanup;
            }
            // Superseded while running: its cleanup is due at once.
            Ok(Some(cleanup)) => {
                if let Err(error) = self.run_cleanup(def, runtime, cleanup) {
                    errors.push(error);
                }
            }
            Ok(None) => {}
            Err(error) => {
                if current {
                    self.commit_effect_reads(def, reads);
                }
                // Rerun once the pending dependency settles.
                if !error.is_pending() {
                    errors.push(error);
                }
            }
        }
        Error::collect(errors)
    }

    /// Record the cells an effect read, at their current revisions.
    ///
    /// Writes the effect made to its own dependencies are absorbed.
    fn commit_effect_reads(&self, def: &Rc<CellDef>, reads: IndexMap<CellId, Dependency>) {
        {
            let mut graph = self.inner.graph.borrow_mut();
            let reads: IndexMap<CellId, Dependency> = reads
                .into_iter()
                .map(|(id, mut dep)| {
                    if let Some(revision) = graph.revision(id) {
                        dep.revision = revision;
                    }
                    (id, dep)
                })
                .collect();
            if let Some(state) = graph.states.get_mut(&def.id) {
                state.dependencies = reads;
            }
            graph.invalidated.remove(&def.id);
        }
        self.mount_dependencies(def);
    }

    fn run_cleanup(&self, def: &Rc<CellDef>, runtime: &Rc<EffectRuntime>, cleanup: Cleanup) -> Result<()> {
        runtime.state.borrow_mut().from_cleanup = true;
        self.inner.batch_depth.set(self.inner.batch_depth.get() + 1);
        let result = {
            let setter = EffectSetter {
                store: self,
                def,
                runtime,
            };
            (cleanup.0)(&setter)
        };
        self.inner.batch_depth.set(self.inner.batch_depth.get() - 1);
        runtime.state.borrow_mut().from_cleanup = false;
        result
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
