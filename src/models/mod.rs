//! Calibration model representation.
//!
//! The model is plain data (serializable breakpoints) so that fitting and
//! evaluation can run in separate invocations.

pub mod calibration;

pub use calibration::*;
