//! Mathematical utilities: great-circle distance and isotonic regression.

pub mod geo;
pub mod pav;

pub use geo::*;
pub use pav::*;
