//! Reporting utilities: run summaries and terminal tables.

pub mod format;

pub use format::*;
