//! Reactive Primitives
//!
//! This module implements the cell store: cell definitions, the store that
//! holds their values, and the effect cells layered on top.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A cell is a definition, not a value. Primitive cells hold a value that
//! changes only when written. Derived cells compute their value from other
//! cells; every cell they read during a derivation becomes a dependency.
//! Any cell may also have a write function, and a mount hook that runs
//! while the cell is mounted.
//!
//! ## Stores
//!
//! A [`Store`] holds one state per cell: the value or error, a revision that
//! moves whenever the value changes, and the dependencies read by the last
//! derivation. Reads pull: a cached value is reused as long as every
//! dependency still has the revision it had. Writes push: mounted cells
//! downstream of a write are recomputed, in dependency order, before the
//! write returns, and listeners run once per write.
//!
//! ## Effects
//!
//! An effect cell runs host code whenever its dependencies change, with a
//! cleanup before each rerun and on unmount. See [`effect`] and
//! [`sync_effect`].
//!
//! ## Async cells
//!
//! A derivation may produce a future. Until it settles the cell is pending,
//! and so is every cell that reads it. Only the result of the newest
//! derivation is ever committed, and an older future is dropped as soon
//! as it is superseded. The future may keep reading cells through an
//! [`AsyncGetter`]; those reads count as dependencies too.
//!
//! # Implementation Notes
//!
//! Dependency tracking is explicit: derivations receive a [`Getter`] and
//! every read goes through it, so no thread-local context is needed and
//! a derivation cannot leak reads into another cell.

mod cell;
mod context;
mod effect;
mod inspect;
mod mount;
pub(crate) mod pending;
mod runtime;
pub(crate) mod subscriber;

pub use cell::{Cell, CellId, CellValue, OnUnmount, PrimitiveCell, SetAction, WritableCell};
pub use context::{AsyncGetter, Getter, ReadOptions, Setter};
pub use effect::{effect, sync_effect, Cleanup, EffectGetter, EffectSetter};
pub use inspect::{CellInfo, Snapshot};
pub use pending::{AbortSignal, Aborted};
pub use runtime::{Store, StoreBuilder};
pub use subscriber::{ListenerId, SetSelf, Subscription};

pub(crate) use cell::{CellDef, Read, Value};
pub(crate) use effect::{EffectMode, EffectRuntime};
pub(crate) use runtime::StoreInner;
