//! Cell Combinators
//!
//! Ready-made cells built on the cell API: reducers, refreshable,
//! resettable and lazy cells, projections, loadable and unwrapped views of
//! async cells, and keyed families.

mod default;
mod family;
mod lazy;
mod loadable;
mod reducer;
mod refresh;
mod select;
mod unwrap;

pub use default::{resettable, with_default, ResetAction};
pub use family::CellFamily;
pub use lazy::lazy;
pub use loadable::{loadable, Loadable};
pub use reducer::reducer;
pub use refresh::{refreshable, Refresh};
pub use select::{select, select_with};
pub use unwrap::unwrap;
