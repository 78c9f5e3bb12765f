//! Database module for PulseWatch.
//!
//! Provides SQLite storage for targets and their checks, with embedded
//! migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
