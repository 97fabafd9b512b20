//! Core data model and configuration for the vigil error-monitoring backend.
//!
//! Everything here is plain data: no I/O, no async. The store, pipeline, and
//! API crates all build on these types.

pub mod config;
pub mod keys;
pub mod metadata;
pub mod types;
