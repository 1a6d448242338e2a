//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - cell and measurement value types (`CellIdentity`, `Measurement`, `CellSite`)
//! - pairs, both borrowed from a store (`Pair`) and persisted (`PairRecord`)
//! - run configuration (`RunConfig`) and its policy enums

pub mod types;

pub use types::*;
