//! Cell Definitions
//!
//! A cell is the atomic reactive unit. Its definition is an immutable
//! descriptor: an identity, how its value is produced (a stored initial
//! value, a derivation, or an effect), an optional write function and an
//! optional mount hook. The definition holds no value. Values live in a
//! [`Store`], one state record per definition per store.
//!
//! # Identity
//!
//! Identity is reference based. Two definitions built from identical
//! closures are distinct cells. Cloning a handle clones the reference, not
//! the cell.
//!
//! # Kinds
//!
//! - [`WritableCell::primitive`] holds a value and accepts [`SetAction`]s.
//! - [`Cell::derived`] recomputes from the cells it reads.
//! - [`Cell::derived_async`] produces its value through a future.
//! - [`WritableCell::derived`] pairs a derivation with a write function,
//!   and [`WritableCell::derived_async`] does the same for a future.
//! - [`WritableCell::with_init`] holds a value but is written through a
//!   custom write function.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;

use crate::error::{Error, Result};

use super::context::{Getter, ReadOptions, Setter};
use super::effect::EffectCore;
use super::runtime::Store;
use super::subscriber::SetSelf;

/// Counter for generating unique cell IDs.
static CELL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Type-erased cell value.
pub(crate) type Value = Rc<dyn Any>;

/// Values a cell can hold.
///
/// `PartialEq` decides whether a recomputed value counts as a change.
pub trait CellValue: Clone + PartialEq + 'static {}

impl<T> CellValue for T where T: Clone + PartialEq + 'static {}

/// Unique identifier of a cell definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        Self(CELL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell{}", self.0)
    }
}

/// Result of running a derivation.
pub(crate) enum Derived {
    Ready(Value),
    Pending(LocalBoxFuture<'static, Result<Value>>),
}

pub(crate) type ErasedRead = dyn Fn(&Getter<'_>, &ReadOptions<'_>) -> Result<Derived>;
pub(crate) type ErasedWrite = dyn Fn(&Store, &Rc<CellDef>, Box<dyn Any>) -> Result<Box<dyn Any>>;
pub(crate) type EqFn = dyn Fn(&dyn Any, &dyn Any) -> bool;
pub(crate) type ErasedMount = dyn Fn(&Store, &Rc<CellDef>) -> Result<Option<OnUnmount>>;

/// Callback returned by a mount hook, run when the cell unmounts.
pub type OnUnmount = Box<dyn FnOnce() -> Result<()>>;

/// How a cell produces its value.
pub(crate) enum Read {
    /// Backing value; starts at the initial value and changes only by writes.
    Source(Value),
    /// Backing value whose initial value is computed on first use in a store.
    Lazy(Box<dyn Fn() -> Value>),
    /// Derivation over other cells.
    Derive(Box<ErasedRead>),
    /// Effect; the value is always `()`.
    Effect(Rc<EffectCore>),
}

#[derive(Default)]
struct Meta {
    label: Option<String>,
    private: bool,
}

/// Immutable, type-erased cell descriptor shared by all handles.
pub(crate) struct CellDef {
    pub(crate) id: CellId,
    pub(crate) read: Read,
    pub(crate) write: Option<Box<ErasedWrite>>,
    pub(crate) eq: Box<EqFn>,
    on_mount: RefCell<Option<Rc<ErasedMount>>>,
    meta: RefCell<Meta>,
}

impl CellDef {
    pub(crate) fn new<T: CellValue>(read: Read, write: Option<Box<ErasedWrite>>) -> Rc<Self> {
        Self::with_eq(read, write, Box::new(eq_erased::<T>))
    }

    pub(crate) fn with_eq(read: Read, write: Option<Box<ErasedWrite>>, eq: Box<EqFn>) -> Rc<Self> {
        Rc::new(Self {
            id: CellId::next(),
            read,
            write,
            eq,
            on_mount: RefCell::new(None),
            meta: RefCell::new(Meta::default()),
        })
    }

    pub(crate) fn is_effect(&self) -> bool {
        matches!(self.read, Read::Effect(_))
    }

    pub(crate) fn is_source(&self) -> bool {
        matches!(self.read, Read::Source(_) | Read::Lazy(_))
    }

    pub(crate) fn mount_hook(&self) -> Option<Rc<ErasedMount>> {
        self.on_mount.borrow().clone()
    }

    pub(crate) fn has_mount_hook(&self) -> bool {
        self.on_mount.borrow().is_some()
    }

    pub(crate) fn label(&self) -> Option<String> {
        self.meta.borrow().label.clone()
    }

    pub(crate) fn is_private(&self) -> bool {
        self.meta.borrow().private
    }
}

fn eq_erased<T: CellValue>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Clone a typed value out of an erased one.
pub(crate) fn downcast<T: 'static + Clone>(id: CellId, value: &Value) -> Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or(Error::TypeMismatch(id))
}

/// Take a typed write result out of an erased one.
pub(crate) fn downcast_output<R: 'static>(id: CellId, output: Box<dyn Any>) -> Result<R> {
    output
        .downcast::<R>()
        .map(|r| *r)
        .map_err(|_| Error::TypeMismatch(id))
}

/// A readable cell holding values of type `T`.
pub struct Cell<T> {
    pub(crate) def: Rc<CellDef>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: CellValue> Cell<T> {
    pub(crate) fn from_def(def: Rc<CellDef>) -> Self {
        Self {
            def,
            _marker: PhantomData,
        }
    }

    /// Create a derived cell.
    ///
    /// The derivation reads other cells through the [`Getter`]; every read is
    /// recorded as a dependency. The cell recomputes when one of them changes.
    ///
    /// ```rust,ignore
    /// let count = WritableCell::primitive(2);
    /// let c = count.clone();
    /// let doubled = Cell::derived(move |get| Ok(get.get(&c)? * 2));
    /// ```
    pub fn derived<F>(derive: F) -> Self
    where
        F: Fn(&Getter<'_>) -> Result<T> + 'static,
    {
        Self::from_def(CellDef::new::<T>(Read::Derive(erase_read(derive)), None))
    }

    /// Create a derived cell with a custom notion of "unchanged".
    ///
    /// When `eq` holds between the previous and the recomputed value, the
    /// previous value is kept and dependents are not recomputed.
    pub fn derived_with_eq<F, E>(derive: F, eq: E) -> Self
    where
        F: Fn(&Getter<'_>) -> Result<T> + 'static,
        E: Fn(&T, &T) -> bool + 'static,
    {
        let eq = move |a: &dyn Any, b: &dyn Any| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => eq(a, b),
            _ => false,
        };
        Self::from_def(CellDef::with_eq(Read::Derive(erase_read(derive)), None, Box::new(eq)))
    }

    /// Create a derived cell whose value is produced asynchronously.
    ///
    /// Dependencies are read synchronously; the returned future computes the
    /// value. While the future runs, readers get [`Error::Pending`]. A newer
    /// derivation supersedes an older one: the older result is discarded and
    /// its [`AbortSignal`](super::AbortSignal) is raised.
    ///
    /// The future may keep reading cells through [`ReadOptions::getter`].
    pub fn derived_async<F, Fut>(derive: F) -> Self
    where
        F: Fn(&Getter<'_>, &ReadOptions<'_>) -> Result<Fut> + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::from_def(CellDef::new::<T>(Read::Derive(erase_async_read(derive)), None))
    }
}

impl<T> Cell<T> {
    /// Get the cell's unique ID.
    pub fn id(&self) -> CellId {
        self.def.id
    }

    /// Attach a debug label.
    pub fn with_label(self, label: impl Into<String>) -> Self {
        self.def.meta.borrow_mut().label = Some(label.into());
        self
    }

    /// The debug label, if any.
    pub fn label(&self) -> Option<String> {
        self.def.label()
    }

    /// Hide the cell from inspection output.
    pub fn private(self) -> Self {
        self.def.meta.borrow_mut().private = true;
        self
    }
}

fn erase_read<T, F>(derive: F) -> Box<ErasedRead>
where
    T: CellValue,
    F: Fn(&Getter<'_>) -> Result<T> + 'static,
{
    Box::new(move |get: &Getter<'_>, _: &ReadOptions<'_>| {
        derive(get).map(|v| Derived::Ready(Rc::new(v) as Value))
    })
}

fn erase_async_read<T, F, Fut>(derive: F) -> Box<ErasedRead>
where
    T: CellValue,
    F: Fn(&Getter<'_>, &ReadOptions<'_>) -> Result<Fut> + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    Box::new(move |get: &Getter<'_>, options: &ReadOptions<'_>| {
        let future = derive(get, options)?;
        Ok(Derived::Pending(
            future.map(|result| result.map(|v| Rc::new(v) as Value)).boxed_local(),
        ))
    })
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            def: Rc::clone(&self.def),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Cell<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.def, &other.def)
    }
}

impl<T> Eq for Cell<T> {}

impl<T> Hash for Cell<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.def.id.hash(state);
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.def.id)
            .field("label", &self.def.label())
            .finish()
    }
}

/// Write argument of primitive cells.
pub enum SetAction<T> {
    /// Replace the value.
    Value(T),
    /// Compute the next value from the current one.
    Update(Box<dyn FnOnce(&T) -> T>),
}

impl<T> SetAction<T> {
    /// Build an update action.
    pub fn update(f: impl FnOnce(&T) -> T + 'static) -> Self {
        SetAction::Update(Box::new(f))
    }

    /// Apply the action to the current value.
    pub fn apply(self, current: &T) -> T {
        match self {
            SetAction::Value(v) => v,
            SetAction::Update(f) => f(current),
        }
    }
}

impl<T> From<T> for SetAction<T> {
    fn from(value: T) -> Self {
        SetAction::Value(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for SetAction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetAction::Value(v) => f.debug_tuple("Value").field(v).finish(),
            SetAction::Update(_) => f.write_str("Update(..)"),
        }
    }
}

/// A cell with a write function, written with arguments `A` and returning `R`.
pub struct WritableCell<T, A = SetAction<T>, R = ()> {
    cell: Cell<T>,
    _marker: PhantomData<fn(A) -> R>,
}

/// A cell holding a value, written with [`SetAction`]s.
pub type PrimitiveCell<T> = WritableCell<T, SetAction<T>, ()>;

impl<T: CellValue> WritableCell<T> {
    /// Create a primitive cell with an initial value.
    pub fn primitive(init: T) -> Self {
        Self::with_init(init, write_primitive::<T>)
    }

    /// Primitive cell whose initial value is made on first use in each store.
    pub(crate) fn from_lazy_init(init: impl Fn() -> T + 'static) -> Self {
        let read = Read::Lazy(Box::new(move || Rc::new(init()) as Value));
        let def = CellDef::new::<T>(read, Some(erase_write(write_primitive::<T>)));
        Self::from_cell(Cell::from_def(def))
    }
}

fn write_primitive<T: CellValue>(set: &Setter<'_, T>, action: SetAction<T>) -> Result<()> {
    let current = set.get_self()?;
    set.set_value(action.apply(&current))
}

impl<T, A, R> WritableCell<T, A, R>
where
    T: CellValue,
    A: 'static,
    R: 'static,
{
    /// Create a cell that holds a value but is written through `write`.
    ///
    /// The write function commits to the cell's own value with
    /// [`Setter::set_value`].
    pub fn with_init<W>(init: T, write: W) -> Self
    where
        W: Fn(&Setter<'_, T>, A) -> Result<R> + 'static,
    {
        let def = CellDef::new::<T>(Read::Source(Rc::new(init)), Some(erase_write(write)));
        Self::from_cell(Cell::from_def(def))
    }

    /// Create a derived cell with a write function.
    ///
    /// The cell has no value of its own; writes are forwarded to other
    /// cells through the [`Setter`].
    pub fn derived<F, W>(derive: F, write: W) -> Self
    where
        F: Fn(&Getter<'_>) -> Result<T> + 'static,
        W: Fn(&Setter<'_, T>, A) -> Result<R> + 'static,
    {
        let def = CellDef::new::<T>(Read::Derive(erase_read(derive)), Some(erase_write(write)));
        Self::from_cell(Cell::from_def(def))
    }

    /// Create an async derived cell with a write function.
    ///
    /// The future can write the cell through [`ReadOptions::set_self`] once
    /// the derivation has returned it.
    pub fn derived_async<F, Fut, W>(derive: F, write: W) -> Self
    where
        F: Fn(&Getter<'_>, &ReadOptions<'_>) -> Result<Fut> + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        W: Fn(&Setter<'_, T>, A) -> Result<R> + 'static,
    {
        let def = CellDef::new::<T>(Read::Derive(erase_async_read(derive)), Some(erase_write(write)));
        Self::from_cell(Cell::from_def(def))
    }

    fn from_cell(cell: Cell<T>) -> Self {
        Self {
            cell,
            _marker: PhantomData,
        }
    }

    /// Install a mount hook.
    ///
    /// The hook runs once when the cell becomes mounted. It receives a
    /// setter bound to this cell and may return a callback that runs on
    /// unmount.
    pub fn with_on_mount<M>(self, on_mount: M) -> Self
    where
        M: Fn(SetSelf<A, R>) -> Result<Option<OnUnmount>> + 'static,
    {
        let hook = move |store: &Store, def: &Rc<CellDef>| on_mount(SetSelf::new(store, def));
        *self.cell.def.on_mount.borrow_mut() = Some(Rc::new(hook));
        self
    }

    /// Attach a debug label.
    pub fn with_label(self, label: impl Into<String>) -> Self {
        Self::from_cell(self.cell.with_label(label))
    }

    /// Hide the cell from inspection output.
    pub fn private(self) -> Self {
        Self::from_cell(self.cell.private())
    }

    /// Borrow the read side of the cell.
    pub fn as_cell(&self) -> &Cell<T> {
        &self.cell
    }
}

fn erase_write<T, A, R, W>(write: W) -> Box<ErasedWrite>
where
    T: CellValue,
    A: 'static,
    R: 'static,
    W: Fn(&Setter<'_, T>, A) -> Result<R> + 'static,
{
    Box::new(move |store: &Store, def: &Rc<CellDef>, arg: Box<dyn Any>| {
        let arg = arg.downcast::<A>().map_err(|_| Error::TypeMismatch(def.id))?;
        let setter = Setter::new(store, def);
        let result = write(&setter, *arg)?;
        Ok(Box::new(result) as Box<dyn Any>)
    })
}

impl<T, A, R> Deref for WritableCell<T, A, R> {
    type Target = Cell<T>;

    fn deref(&self) -> &Cell<T> {
        &self.cell
    }
}

impl<T, A, R> Clone for WritableCell<T, A, R> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, A, R> fmt::Debug for WritableCell<T, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableCell")
            .field("id", &self.cell.def.id)
            .field("label", &self.cell.def.label())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
