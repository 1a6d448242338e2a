//! Input/output helpers.
//!
//! - measurement and cell-site CSV ingest + validation (`ingest`)
//! - the pairs store in CSV or binary form (`pairs`)
//! - per-pair results export (`export`)
//! - model JSON and curve CSVs (`curve`)

pub mod curve;
pub mod export;
pub mod ingest;
pub mod pairs;

pub use curve::*;
pub use export::*;
pub use ingest::*;
pub use pairs::*;
