//! Notification dispatch: cooldown discipline, member selection with quiet
//! hours and digest deferral, context enrichment, and delivery over the
//! channel adapters.

pub mod alert;
pub mod channels;
pub mod digest;
pub mod dispatcher;
pub mod enrich;
pub mod quiet;

pub use alert::{AlertSnapshot, Enrichment};
pub use channels::{
    ChannelPreview, EmailChannel, HttpChannelSet, MemorySmtp, SmtpSender, SmtpTransportSender,
};
pub use digest::DigestFlusher;
pub use dispatcher::{ChannelOutcome, DispatchResult, Dispatcher};
