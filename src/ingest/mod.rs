//! Inbound reply ingestion.
//!
//! push envelope → [`envelope`] → message fetch → [`body`] → [`matcher`]

pub mod body;
pub mod envelope;
pub mod ingestor;
pub mod matcher;

pub use body::InboundMail;
pub use envelope::{Notification, NotificationContent, decode_push};
pub use ingestor::{HandlingResult, NotificationIngestor};
pub use matcher::{MatchOutcome, ReplyMatcher, ReplyNotification, SkipReason, strip_reply_prefix};
