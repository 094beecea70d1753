//! Mail ingestion
//!
//! Mail for every disposable address is forwarded by Cloudflare to one collecting mailbox.
//! A fetch searches that mailbox from a watermark, routes each message to the active local
//! accounts among its recipients and stores what is new. Fetches run as single-flight jobs
//! whose progress can be polled, either on demand or from the periodic scheduler.

pub mod attachments;
pub mod mailbox;
pub mod parse;
pub mod progress;
pub mod retry;
pub mod service;
pub mod tunnel;

pub use attachments::AttachmentStore;
pub use mailbox::{ImapConnector, MailboxClient, MailboxConnector, MailboxSession};
pub use parse::{Envelope, ParsedAttachment, ParsedMessage};
pub use progress::{
    FetchProgress, FetchResult, FetchStep, InMemoryJobStore, JobId, JobStatusStore,
};
pub use retry::{Recover, RetryPolicy};
pub use service::{MailService, TriggerOutcome};
