//! `cell-colocation` library crate.
//!
//! The binary (`coloc`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the pairing, calibration and evaluation steps are reusable on their own

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod eval;
pub mod features;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod pairing;
pub mod plot;
pub mod report;
pub mod store;
