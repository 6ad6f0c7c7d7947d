//! Repository layer: table-scoped database operations.
//! Public functions are re-exported here.

mod knowledge;
mod profile_history;

pub use knowledge::*;
pub use profile_history::*;
