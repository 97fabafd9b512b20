//! The ingest path: validation, PII scrubbing, fingerprinting, and the
//! write into the aggregation store.
//!
//! Order matters: scrubbing runs before fingerprinting so a fingerprint can
//! never encode PII, and both run before anything is persisted.

pub mod fingerprint;
pub mod ingest;
pub mod scrub;
pub mod validate;

pub use ingest::{IngestError, IngestPipeline, IngestReply, IngestedEvent};
pub use scrub::Scrubber;
pub use validate::{FieldError, RawEvent, ValidationFailure};
