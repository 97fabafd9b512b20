//! Process-level plumbing shared by the API and the daemon: per-key quota
//! enforcement, bounded retry with backoff, and cooperative shutdown.

pub mod backoff;
pub mod quota;
pub mod shutdown;
