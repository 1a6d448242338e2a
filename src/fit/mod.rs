//! Calibration fitting.
//!
//! Responsibilities:
//!
//! - fit a monotonic score → LR mapping with PAV (`pav`)
//! - measure calibration quality: Cllr, Cllr-min (`metrics`)

pub mod metrics;
pub mod pav;

pub use metrics::*;
pub use pav::*;
