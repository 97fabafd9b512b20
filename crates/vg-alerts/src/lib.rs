//! Alert rule evaluation: a pure engine over a metrics snapshot, plus the
//! builder that assembles those snapshots from the store with per-event
//! memoization.

pub mod engine;
pub mod filters;
pub mod snapshot;

pub use engine::{evaluate, Evaluation, RuleMetrics, TriggerReason};
pub use snapshot::SnapshotBuilder;
