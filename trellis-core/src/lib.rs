//! Trellis Core
//!
//! This crate provides a pull-based reactive cell store. It implements:
//!
//! - Cells: primitive, derived, writable-derived and async
//! - A store that tracks dependencies, recomputes glitch-free and notifies
//!   listeners once per write
//! - Mount and unmount hooks for cells that are observed
//! - Effect cells with cleanup and controlled recursion
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Cells, the store runtime, mounting, async and effects
//! - `graph`: Per-store cell states, invalidation and update ordering
//! - `utils`: Cell combinators built on the public API
//! - `config`, `error`: Store configuration and the error type
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::{Cell, Store, WritableCell};
//!
//! let store = Store::new();
//!
//! // Create a primitive cell
//! let count = WritableCell::primitive(0);
//!
//! // Create a derived cell
//! let c = count.clone();
//! let doubled = Cell::derived(move |get| Ok(get.get(&c)? * 2));
//!
//! // Subscribe
//! let _sub = store.sub(&doubled, || println!("doubled changed"))?;
//!
//! // Write; the listener runs once, doubled is already 10
//! store.set(&count, 5)?;
//! assert_eq!(store.get(&doubled)?, 10);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod utils;

pub use config::{DeferredFlush, StoreConfig};
pub use error::{Error, Result};
pub use graph::Status;
pub use reactive::{
    effect, sync_effect, AbortSignal, AsyncGetter, Cell, CellId, CellInfo, Cleanup, PrimitiveCell,
    ReadOptions, SetAction, SetSelf, Snapshot, Store, Subscription, WritableCell,
};
