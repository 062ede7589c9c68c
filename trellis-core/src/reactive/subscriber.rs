//! Subscriptions and bound setters.
//!
//! A subscription is how the outside world keeps a cell mounted. Its
//! listener runs once per flush in which the cell changed. Dropping the
//! subscription unsubscribes; [`Subscription::unsubscribe`] does the same
//! but reports errors from unmount hooks instead of logging them.

use std::cell::Cell as Flag;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use super::cell::{downcast_output, Cell, CellDef};
use super::runtime::{Store, StoreInner};
use super::CellId;
use crate::error::{Error, Result};

/// Unique identifier for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`Store::sub`]. Unsubscribes on drop.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    store: Weak<StoreInner>,
    def: Rc<CellDef>,
    listener: ListenerId,
    active: bool,
}

impl Subscription {
    /// The subscribed cell.
    pub fn cell_id(&self) -> CellId {
        self.def.id
    }

    /// The listener registered by this subscription.
    pub fn listener_id(&self) -> ListenerId {
        self.listener
    }

    /// Unsubscribe, returning errors raised by unmount hooks or cleanups.
    pub fn unsubscribe(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !std::mem::replace(&mut self.active, false) {
            return Ok(());
        }
        match self.store.upgrade() {
            Some(inner) => Store::from_inner(inner).remove_listener(&self.def, self.listener),
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            warn!(cell = %self.def.id, %error, "unsubscribe failed");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cell", &self.def.id)
            .field("listener", &self.listener)
            .field("active", &self.active)
            .finish()
    }
}

impl Store {
    /// Subscribe to a cell.
    ///
    /// Mounts the cell and its dependencies, runs mount hooks and initial
    /// effect runs, and registers `listener`. The listener is called once
    /// per flush in which the cell's revision changed.
    ///
    /// If a hook fails while mounting, the subscription is torn down again
    /// and the error is returned.
    pub fn sub<T>(&self, cell: &Cell<T>, listener: impl Fn() + 'static) -> Result<Subscription> {
        let def = &cell.def;
        let listener_id = ListenerId::new();
        self.mount_cell(def);
        {
            let mut graph = self.inner.graph.borrow_mut();
            match graph.mounted.get_mut(&def.id) {
                Some(mounted) => {
                    mounted.listeners.insert(listener_id, Rc::new(listener));
                }
                None => {
                    return Err(Error::Invariant(format!(
                        "{} not mounted after mount",
                        def.id
                    )))
                }
            }
        }
        let subscription = Subscription {
            store: Rc::downgrade(&self.inner),
            def: Rc::clone(def),
            listener: listener_id,
            active: true,
        };
        match self.flush() {
            Ok(()) => Ok(subscription),
            Err(error) => {
                if let Err(teardown) = subscription.unsubscribe() {
                    debug!(cell = %def.id, error = %teardown, "teardown after failed mount");
                }
                Err(error)
            }
        }
    }

    fn remove_listener(&self, def: &Rc<CellDef>, listener: ListenerId) -> Result<()> {
        if let Some(mounted) = self.inner.graph.borrow_mut().mounted.get_mut(&def.id) {
            mounted.listeners.shift_remove(&listener);
        }
        self.unmount_cell(def.id);
        self.flush()
    }
}

/// Setter bound to one cell, handed to mount hooks and async derivations.
///
/// Each call is a full transaction, like [`Store::set`]. The handle holds
/// the store and the cell weakly; once either is gone, calls fail.
pub struct SetSelf<A, R = ()> {
    store: Weak<StoreInner>,
    def: Weak<CellDef>,
    /// Raised while the async derivation that made the handle still runs.
    deriving: Option<Rc<Flag<bool>>>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A: 'static, R: 'static> SetSelf<A, R> {
    pub(crate) fn new(store: &Store, def: &Rc<CellDef>) -> Self {
        Self {
            store: Rc::downgrade(&store.inner),
            def: Rc::downgrade(def),
            deriving: None,
            _marker: PhantomData,
        }
    }

    pub(crate) fn after_read(store: &Store, def: &Rc<CellDef>, deriving: Rc<Flag<bool>>) -> Self {
        Self {
            deriving: Some(deriving),
            ..Self::new(store, def)
        }
    }

    /// Write the bound cell.
    pub fn set(&self, arg: impl Into<A>) -> Result<R> {
        let (Some(inner), Some(def)) = (self.store.upgrade(), self.def.upgrade()) else {
            return Err(Error::Invariant("set on a dropped store or cell".into()));
        };
        if self.deriving.as_ref().is_some_and(|deriving| deriving.get()) {
            return Err(Error::SetSelfInRead(def.id));
        }
        let output = Store::from_inner(inner).set_erased(&def, Box::new(arg.into()))?;
        downcast_output(def.id, output)
    }
}

impl<A, R> Clone for SetSelf<A, R> {
    fn clone(&self) -> Self {
        Self {
            store: Weak::clone(&self.store),
            def: Weak::clone(&self.def),
            deriving: self.deriving.clone(),
            _marker: PhantomData,
        }
    }
}
