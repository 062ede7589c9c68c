//! Reactive Context
//!
//! The handles passed to user code while the store runs it.
//!
//! - [`Getter`] is given to derivations. Every cell it reads is recorded,
//!   in read order, together with the revision that was observed. When the
//!   derivation finishes, the recorded set replaces the cell's dependency
//!   snapshot as a whole.
//! - [`ReadOptions`] carries what an async derivation's future takes with
//!   it: the abort signal, an [`AsyncGetter`] that keeps tracking reads
//!   after the derivation returned, and a [`SetSelf`] for writable cells.
//! - [`Setter`] is given to write functions. Its reads are untracked, and
//!   its writes are part of the enclosing transaction: nothing is
//!   recomputed for listeners until the outermost `set` returns.
//!
//! # Implementation
//!
//! Unlike a thread-local "current computation" stack, the tracking state
//! lives on the getter itself. Nested derivations get their own getter, so
//! reads can never be attributed to the wrong cell.

use std::cell::{Cell as Flag, OnceCell, RefCell};
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::cell::{downcast, downcast_output, Cell, CellDef, CellValue, Value, WritableCell};
use super::pending::{AbortSignal, PendingToken};
use super::runtime::{Store, StoreInner};
use super::subscriber::SetSelf;
use super::CellId;
use crate::error::{Error, Result};
use crate::graph::Dependency;

/// Tracking reader passed to derivations.
pub struct Getter<'a> {
    store: &'a Store,
    cell: &'a Rc<CellDef>,
    dependencies: RefCell<IndexMap<CellId, Dependency>>,
}

impl<'a> Getter<'a> {
    pub(crate) fn new(store: &'a Store, cell: &'a Rc<CellDef>) -> Self {
        Self {
            store,
            cell,
            dependencies: RefCell::new(IndexMap::new()),
        }
    }

    /// Read a cell and record it as a dependency.
    ///
    /// A pending cell yields [`Error::Pending`]; propagate it with `?` to
    /// make the reading cell pending too.
    pub fn get<T: CellValue>(&self, cell: &Cell<T>) -> Result<T> {
        let value = self.read(&cell.def)?;
        downcast(cell.id(), &value)
    }

    /// The last value a cell settled on in this store, even while it is
    /// pending. Not recorded as a dependency.
    pub fn last_settled<T: CellValue>(&self, cell: &Cell<T>) -> Option<T> {
        let value = self
            .store
            .inner
            .graph
            .borrow()
            .states
            .get(&cell.id())
            .and_then(|state| state.last_value().cloned())?;
        value.downcast_ref::<T>().cloned()
    }

    pub(crate) fn read(&self, def: &Rc<CellDef>) -> Result<Value> {
        if def.id == self.cell.id {
            return Err(Error::SelfRead(def.id));
        }
        let snapshot = self.store.read_state(def);
        // Recorded even on failure, so a change in this cell retries us.
        self.dependencies.borrow_mut().insert(
            def.id,
            Dependency {
                def: Rc::clone(def),
                revision: snapshot.revision,
            },
        );
        snapshot.outcome
    }

    pub(crate) fn into_dependencies(self) -> IndexMap<CellId, Dependency> {
        self.dependencies.into_inner()
    }
}

/// Options passed to async derivations.
pub struct ReadOptions<'a> {
    store: &'a Store,
    cell: &'a Rc<CellDef>,
    token: OnceCell<PendingToken>,
    /// Set until the derivation has returned.
    deriving: Rc<Flag<bool>>,
}

impl<'a> ReadOptions<'a> {
    pub(crate) fn new(store: &'a Store, cell: &'a Rc<CellDef>) -> Self {
        Self {
            store,
            cell,
            token: OnceCell::new(),
            deriving: Rc::new(Flag::new(true)),
        }
    }

    /// The token the returned future will run under, made on first use.
    fn token(&self) -> &PendingToken {
        self.token.get_or_init(PendingToken::new)
    }

    /// Abort signal for this derivation.
    ///
    /// Raised when a newer derivation of the same cell supersedes this one.
    pub fn signal(&self) -> AbortSignal {
        self.token().signal().cloned().unwrap_or_default()
    }

    /// A getter the returned future can keep.
    pub fn getter(&self) -> AsyncGetter {
        AsyncGetter {
            store: Rc::downgrade(&self.store.inner),
            cell: Rc::clone(self.cell),
            token: self.token().clone(),
        }
    }

    /// A writer bound to this cell, for the returned future.
    ///
    /// Writing before the derivation has returned fails with
    /// [`Error::SetSelfInRead`].
    pub fn set_self<A: 'static, R: 'static>(&self) -> SetSelf<A, R> {
        SetSelf::after_read(self.store, self.cell, Rc::clone(&self.deriving))
    }

    /// End the synchronous phase, returning the token if one was made.
    pub(crate) fn finish(self) -> Option<PendingToken> {
        self.deriving.set(false);
        self.token.into_inner()
    }
}

/// Tracking reader kept by the future of an async derivation.
///
/// Reads count as dependencies of the cell for as long as the derivation
/// that made the getter is the cell's current one. A mounted cell mounts
/// what it reads, so later changes recompute it.
pub struct AsyncGetter {
    store: Weak<StoreInner>,
    cell: Rc<CellDef>,
    token: PendingToken,
}

impl AsyncGetter {
    /// Read a cell and record it as a dependency.
    pub fn get<T: CellValue>(&self, cell: &Cell<T>) -> Result<T> {
        let Some(inner) = self.store.upgrade() else {
            return Err(Error::Invariant("read through a dropped store".into()));
        };
        if cell.id() == self.cell.id {
            return Err(Error::SelfRead(cell.id()));
        }
        let store = Store::from_inner(inner);
        let observation = store.read_state(&cell.def);
        let dependency = Dependency {
            def: Rc::clone(&cell.def),
            revision: observation.revision,
        };
        store.track_async_read(&self.cell, &self.token, dependency)?;
        let value = observation.outcome?;
        downcast(cell.id(), &value)
    }
}

/// Writer passed to write functions of cells holding `T`.
pub struct Setter<'a, T> {
    store: &'a Store,
    cell: &'a Rc<CellDef>,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: CellValue> Setter<'a, T> {
    pub(crate) fn new(store: &'a Store, cell: &'a Rc<CellDef>) -> Self {
        Self {
            store,
            cell,
            _marker: PhantomData,
        }
    }

    /// Read a cell without recording a dependency.
    ///
    /// Immediate effects triggered by earlier writes in this transaction
    /// have run by the time the value is returned.
    pub fn get<U: CellValue>(&self, cell: &Cell<U>) -> Result<U> {
        self.store.settle_immediate()?;
        self.store.get_untracked(&cell.def)
    }

    /// Read the cell being written.
    pub fn get_self(&self) -> Result<T> {
        self.store.get_untracked(self.cell)
    }

    /// Write another cell as part of the current transaction.
    ///
    /// To change the cell being written, use [`Setter::set_value`].
    pub fn set<U, A, R>(&self, target: &WritableCell<U, A, R>, arg: impl Into<A>) -> Result<R>
    where
        A: 'static,
        R: 'static,
    {
        if target.id() == self.cell.id {
            return Err(Error::SelfWrite(self.cell.id));
        }
        let output = self.store.write_cell(&target.def, Box::new(arg.into()))?;
        downcast_output(target.id(), output)
    }

    /// Commit a new value to the cell being written.
    ///
    /// Only cells with a backing value accept this; derived cells forward
    /// their writes with [`Setter::set`] instead.
    pub fn set_value(&self, value: T) -> Result<()> {
        if !self.cell.is_source() {
            return Err(Error::NotWritable(self.cell.id));
        }
        self.store.commit_source(self.cell, Rc::new(value));
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getter_records_reads_in_order() {
        let store = Store::new();
        let a = WritableCell::primitive(1);
        let b = WritableCell::primitive(2);
        let reader = Cell::derived(|_| Ok(0));

        let getter = Getter::new(&store, &reader.def);
        assert_eq!(getter.get(&b).unwrap(), 2);
        assert_eq!(getter.get(&a).unwrap(), 1);
        assert_eq!(getter.get(&b).unwrap(), 2);

        let deps: Vec<CellId> = getter.into_dependencies().keys().copied().collect();
        assert_eq!(deps, vec![b.id(), a.id()]);
    }

    #[test]
    fn getter_rejects_self_reads() {
        let store = Store::new();
        let cell = Cell::derived(|_| Ok(0));
        let getter = Getter::new(&store, &cell.def);
        assert!(matches!(getter.get(&cell), Err(Error::SelfRead(_))));
    }

    #[test]
    fn token_is_created_on_first_use() {
        let store = Store::new();
        let cell = Cell::derived(|_| Ok(0));
        assert!(ReadOptions::new(&store, &cell.def).finish().is_none());

        let options = ReadOptions::new(&store, &cell.def);
        let signal = options.signal();
        let getter = options.getter();
        let token = options.finish().unwrap();
        assert!(getter.token.ptr_eq(&token));

        assert!(!signal.is_aborted());
        token.abort();
        assert!(signal.is_aborted());
    }

    #[test]
    fn set_self_waits_for_the_derivation_to_return() {
        let store = Store::new();
        let target = WritableCell::primitive(0);
        let t = target.clone();
        let echo = WritableCell::<i32, i32, ()>::derived(|_| Ok(0), move |set, v: i32| set.set(&t, v));

        let options = ReadOptions::new(&store, &echo.def);
        let set_self = options.set_self::<i32, ()>();
        assert!(matches!(set_self.set(1), Err(Error::SetSelfInRead(_))));

        let _ = options.finish();
        set_self.set(2).unwrap();
        assert_eq!(store.get(&target).unwrap(), 2);
    }

    #[test]
    fn async_getter_ignores_superseded_derivations() {
        let store = Store::new();
        let a = WritableCell::primitive(1);
        let cell = Cell::<i32>::derived(|_| Ok(0));

        let options = ReadOptions::new(&store, &cell.def);
        let getter = options.getter();
        let _ = options.finish();

        // The cell never went pending on this token, so nothing is recorded.
        assert_eq!(getter.get(&a).unwrap(), 1);
        assert!(store.inner.graph.borrow().states.get(&cell.id()).is_none());
        assert!(matches!(getter.get(&cell), Err(Error::SelfRead(_))));
    }

    #[test]
    fn set_value_requires_a_backing_value() {
        let store = Store::new();
        let count = WritableCell::primitive(0);
        let derived = Cell::derived(|_| Ok(0));

        Setter::<i32>::new(&store, &count.def).set_value(3).unwrap();
        assert_eq!(store.get(&count).unwrap(), 3);

        let err = Setter::<i32>::new(&store, &derived.def).set_value(3).unwrap_err();
        assert!(matches!(err, Error::NotWritable(_)));
    }
}
