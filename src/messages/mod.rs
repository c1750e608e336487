//! Correspondence records.

pub mod model;

pub use model::{
    AnsweredReply, DraftFields, MessageStatus, OutboundMessage, Shortlist, ShortlistStatus, User,
};
