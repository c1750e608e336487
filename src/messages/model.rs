//! Outbound message, shortlist, and mailbox user records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mail::merge_references;

/// Lifecycle of an outbound message row.
///
/// DRAFT → SENT → (reply detected, new row) ANSWERED, or DRAFT → FAILED on a
/// transport error. Only DRAFT rows are ever edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Draft,
    Sent,
    Failed,
    Answered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Answered => "ANSWERED",
        }
    }

    /// A send job may be scheduled from this state (FAILED is a manual resend).
    pub fn is_sendable(&self) -> bool {
        matches!(self, Self::Draft | Self::Failed)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            "ANSWERED" => Ok(Self::Answered),
            _ => Err(format!("Unknown message status: {}", s)),
        }
    }
}

/// One email in the CRM's correspondence history with an investor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub user_id: String,
    pub investor_id: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub from_address: String,
    /// HTML body for sends, extracted reply text for ANSWERED rows.
    pub body: String,
    pub status: MessageStatus,
    /// Provider conversation key.
    pub thread_id: Option<String>,
    /// RFC Message-ID this message was sent with.
    pub gmail_message_id: Option<String>,
    /// Space-joined chain of earlier Message-IDs.
    pub gmail_references: Option<String>,
    /// The message this one continues.
    pub previous_message_id: Option<Uuid>,
    /// Provider id of the inbound mail an ANSWERED row was created from.
    pub provider_message_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// A new DRAFT for a (user, investor) pair.
    pub fn draft(user_id: &str, investor_id: &str, fields: DraftFields) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            investor_id: investor_id.to_string(),
            to: fields.to,
            cc: fields.cc,
            subject: fields.subject,
            from_address: fields.from_address,
            body: fields.body,
            status: MessageStatus::Draft,
            thread_id: fields.thread_id,
            gmail_message_id: None,
            gmail_references: None,
            previous_message_id: fields.previous_message_id,
            provider_message_id: None,
            scheduled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An ANSWERED row recording an inbound reply to `original`.
    pub fn answered(original: &OutboundMessage, reply: AnsweredReply) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: original.user_id.clone(),
            investor_id: original.investor_id.clone(),
            to: reply.to,
            cc: reply.cc,
            subject: reply.subject,
            from_address: reply.from_address,
            body: reply.body,
            status: MessageStatus::Answered,
            thread_id: reply.thread_id.or_else(|| original.thread_id.clone()),
            gmail_references: merge_references(&[
                original.gmail_references.as_deref(),
                original.gmail_message_id.as_deref(),
                reply.references.as_deref(),
            ]),
            gmail_message_id: reply.rfc_message_id,
            previous_message_id: Some(original.id),
            provider_message_id: reply.provider_message_id,
            scheduled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_draft(&self) -> bool {
        self.status == MessageStatus::Draft
    }
}

/// Editable fields of a draft.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftFields {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    pub subject: String,
    pub from_address: String,
    pub body: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub previous_message_id: Option<Uuid>,
}

/// Data for an ANSWERED row, built from a matched inbound reply.
#[derive(Debug, Clone, PartialEq)]
pub struct AnsweredReply {
    pub from_address: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub rfc_message_id: Option<String>,
    /// The reply's own `References` header, if it carried one.
    pub references: Option<String>,
    pub provider_message_id: Option<String>,
}

/// Pipeline state of an investor on a user's shortlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortlistStatus {
    Shortlisted,
    Contacted,
}

impl ShortlistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shortlisted => "shortlisted",
            Self::Contacted => "contacted",
        }
    }
}

impl std::str::FromStr for ShortlistStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shortlisted" => Ok(Self::Shortlisted),
            "contacted" => Ok(Self::Contacted),
            _ => Err(format!("Unknown shortlist status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortlist {
    pub user_id: String,
    pub investor_id: String,
    pub status: ShortlistStatus,
    pub updated_at: DateTime<Utc>,
}

/// A CRM user with a connected mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    /// Last mailbox history id processed by ingestion.
    pub last_history_id: Option<String>,
}

impl User {
    pub fn new(id: &str, email: &str) -> Self {
        Self {
            id: id.to_string(),
            email: email.to_string(),
            last_history_id: None,
        }
    }
}
