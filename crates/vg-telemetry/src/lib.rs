//! Logging, request correlation, and process-local metrics for vigil.

pub mod logging;
pub mod metrics;
pub mod middleware;
