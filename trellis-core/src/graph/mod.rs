//! Dependency Graph
//!
//! Per-store bookkeeping for cells: what each cell last read, which cells
//! are mounted, and which are waiting to be recomputed.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are cells that a store has touched
//! - Edges are dependencies: if A reads B, there is an edge from B to A
//!
//! Two edge sets are kept. Every cell state records the dependencies its
//! last derivation read, with the revision each had at the time; this is
//! enough for a pull-based read to decide whether the cached value is still
//! good. Mounted cells additionally keep forward and reverse edges among
//! themselves, which is what writes walk to find what must be recomputed
//! and notified.
//!
//! # Design Decisions
//!
//! 1. The graph is centralized in one table per store, indexed by cell ID.
//!
//! 2. Unmounted cells have no reverse edges. They are never pushed to; they
//!    revalidate on the next read.
//!
//! 3. Cell states hold their definitions weakly, so dropping every handle
//!    to a cell lets the store reclaim its state.

mod node;
mod scheduler;

pub use node::Status;

pub(crate) use node::{CellState, Dependency, Displaced, Mounted, Observation};
pub(crate) use scheduler::{Callback, Graph};
