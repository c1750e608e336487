//! `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::messages::{DraftFields, MessageStatus, OutboundMessage, Shortlist, ShortlistStatus, User};

/// Filter for the newest SENT message a reply could answer.
///
/// Address lists hold every case variant to try; comparison is exact.
#[derive(Debug, Clone, Default)]
pub struct SentMessageQuery {
    pub user_id: String,
    /// The stored `to` list must contain one of these, ignoring case. Empty
    /// means no constraint, in which case `subject` is required.
    pub to_any: Vec<String>,
    /// The stored `from` must be one of these, ignoring case.
    pub from_any: Vec<String>,
    /// Case-insensitive subject equality, when set.
    pub subject: Option<String>,
}

/// Identity of an ANSWERED row for duplicate detection.
#[derive(Debug, Clone)]
pub struct AnsweredKey<'a> {
    pub user_id: &'a str,
    pub investor_id: &'a str,
    pub from_address: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    /// Only consider rows created after this instant.
    pub since: Option<DateTime<Utc>>,
}

/// Backend-agnostic database trait for users, messages, and shortlists.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    /// Insert or replace a user.
    async fn upsert_user(&self, user: &User) -> Result<(), DatabaseError>;

    async fn get_user(&self, id: &str) -> Result<Option<User>, DatabaseError>;

    /// Case-insensitive lookup by mailbox address.
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError>;

    /// Store the mailbox history cursor.
    async fn set_last_history_id(&self, user_id: &str, history_id: &str)
    -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message row. A unique-index violation maps to
    /// [`DatabaseError::Constraint`].
    async fn insert_message(&self, message: &OutboundMessage) -> Result<(), DatabaseError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<OutboundMessage>, DatabaseError>;

    /// Create or update the single DRAFT for a (user, investor) pair.
    async fn save_draft(
        &self,
        user_id: &str,
        investor_id: &str,
        fields: DraftFields,
    ) -> Result<OutboundMessage, DatabaseError>;

    async fn update_message_status(
        &self,
        id: Uuid,
        status: MessageStatus,
    ) -> Result<(), DatabaseError>;

    /// Set or clear the scheduled-send marker.
    async fn set_scheduled_at(
        &self,
        id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Most recently created SENT message matching the query.
    async fn find_latest_sent(
        &self,
        query: &SentMessageQuery,
    ) -> Result<Option<OutboundMessage>, DatabaseError>;

    /// An existing ANSWERED row with identical content, if any.
    async fn find_answered(
        &self,
        key: &AnsweredKey<'_>,
    ) -> Result<Option<OutboundMessage>, DatabaseError>;

    /// ANSWERED row created from a given provider message.
    async fn find_answered_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<OutboundMessage>, DatabaseError>;

    /// Messages for an investor, newest first.
    async fn list_messages_for_investor(
        &self,
        user_id: &str,
        investor_id: &str,
    ) -> Result<Vec<OutboundMessage>, DatabaseError>;

    // ── Shortlists ──────────────────────────────────────────────────

    async fn get_shortlist(
        &self,
        user_id: &str,
        investor_id: &str,
    ) -> Result<Option<Shortlist>, DatabaseError>;

    async fn set_shortlist_status(
        &self,
        user_id: &str,
        investor_id: &str,
        status: ShortlistStatus,
    ) -> Result<(), DatabaseError>;
}
