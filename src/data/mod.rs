//! External cell metadata: the `CellDatabase` boundary, an in-memory backend,
//! and duplicate-aware cached resolution.

pub mod celldb;
pub mod resolve;

pub use celldb::*;
pub use resolve::*;
