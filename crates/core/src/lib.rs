//! Shared domain types for the atelier generation service.
//!
//! Pure logic only: no I/O, no database, no HTTP. Everything here is
//! consumed by the `db`, `pipeline` and `api` crates.

pub mod credits;
pub mod error;
pub mod generation;
pub mod progress_events;
pub mod types;
