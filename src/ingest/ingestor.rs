//! Push notification handling: decode, fetch what the ping left out, match.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, info, warn};

use super::body::InboundMail;
use super::envelope::{NotificationContent, decode_push};
use super::matcher::{MatchOutcome, ReplyMatcher, ReplyNotification, SkipReason};
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::messages::User;
use crate::oauth::{ProviderFamily, TokenSource, resolve_token};
use crate::store::Database;
use crate::transport::{GmailMessage, MailboxReader};

/// Outcomes for every message a notification led to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlingResult {
    pub outcomes: Vec<MatchOutcome>,
}

impl HandlingResult {
    fn single(outcome: MatchOutcome) -> Self {
        Self {
            outcomes: vec![outcome],
        }
    }

    pub fn created(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, MatchOutcome::Created(_)))
            .count()
    }
}

/// Message ids a history lookup produced. `complete` is false when the
/// history query itself failed, so ids past the cursor may be missing.
struct AddedIds {
    ids: Vec<String>,
    complete: bool,
}

pub struct NotificationIngestor {
    db: Arc<dyn Database>,
    tokens: Arc<dyn TokenSource>,
    mailbox: Arc<dyn MailboxReader>,
    matcher: ReplyMatcher,
    config: IngestConfig,
}

impl NotificationIngestor {
    pub fn new(
        db: Arc<dyn Database>,
        tokens: Arc<dyn TokenSource>,
        mailbox: Arc<dyn MailboxReader>,
        config: IngestConfig,
    ) -> Self {
        Self {
            matcher: ReplyMatcher::new(Arc::clone(&db), config.fallback_dedup_window),
            db,
            tokens,
            mailbox,
            config,
        }
    }

    /// Handle one push delivery. Only store errors escape; everything else
    /// degrades to a skip or no-match.
    pub async fn handle_notification(&self, raw: &[u8]) -> Result<HandlingResult, IngestError> {
        let notification = match decode_push(raw) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Undecodable push notification");
                return Ok(HandlingResult::single(MatchOutcome::Skipped(
                    SkipReason::Undecodable,
                )));
            }
        };

        let Some(history_id) = notification.history_id.clone() else {
            debug!("Push notification without history id");
            return Ok(HandlingResult::single(MatchOutcome::Skipped(
                SkipReason::MissingHistoryId,
            )));
        };

        let user = match notification.email_address.as_deref() {
            Some(address) => self.db.get_user_by_email(address).await?,
            None => None,
        };
        let Some(user) = user else {
            debug!(mailbox = ?notification.email_address, "Push for unknown mailbox");
            return Ok(HandlingResult::single(MatchOutcome::Skipped(
                SkipReason::UnknownMailbox,
            )));
        };

        if let NotificationContent::Embedded(message) = &notification.content {
            let mut message = message.as_ref().clone();
            // Envelope-level labels apply to the embedded message.
            for label in &notification.label_ids {
                if !message.has_label(label) {
                    message.label_ids.push(label.clone());
                }
            }
            let outcome = self.process_message(&user, &history_id, &message).await?;
            return Ok(HandlingResult::single(outcome));
        }

        let Some(token) = resolve_token(self.tokens.as_ref(), &user.id, ProviderFamily::Google).await
        else {
            warn!(user_id = %user.id, "No Gmail token to fetch notified messages");
            return Ok(HandlingResult::single(MatchOutcome::NoMatch));
        };

        let start = user.last_history_id.clone().unwrap_or_else(|| history_id.clone());
        let added = self.fetch_added_ids(&token.token, &start).await;
        if added.ids.is_empty() {
            debug!(user_id = %user.id, start, "No new messages for notification");
        }

        let mut complete = added.complete;
        let mut result = HandlingResult::default();
        for id in added.ids {
            let message = match self.mailbox.get_message(&token.token, &id).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(message_id = %id, error = %e, "Failed to fetch notified message");
                    complete = false;
                    continue;
                }
            };
            result
                .outcomes
                .push(self.process_message(&user, &history_id, &message).await?);
        }

        // The next push replays from the old cursor if anything was missed.
        if complete {
            self.advance_cursor(&user, &history_id).await;
        } else {
            warn!(user_id = %user.id, start, "History incomplete, cursor kept");
        }
        if result.outcomes.is_empty() {
            result.outcomes.push(MatchOutcome::NoMatch);
        }
        Ok(result)
    }

    /// Added-message ids since `start`, with resubscription and a recent-inbox
    /// fallback when the history query comes back empty or out of scope.
    async fn fetch_added_ids(&self, token: &SecretString, start: &str) -> AddedIds {
        match self.mailbox.list_history(token, start).await {
            Ok(page) if !page.is_empty() => {
                return AddedIds {
                    ids: page.message_ids,
                    complete: true,
                };
            }
            Ok(_) => debug!(start, "History empty"),
            Err(e) if e.is_auth_scope() => warn!(error = %e, "History query out of scope"),
            Err(e) => {
                warn!(error = %e, "History query failed");
                return AddedIds {
                    ids: Vec::new(),
                    complete: false,
                };
            }
        }

        match self.mailbox.watch(token).await {
            Ok(watch) => info!(history_id = ?watch.history_id, "Mailbox resubscribed"),
            Err(e) => warn!(error = %e, "Mailbox resubscription failed"),
        }

        let complete = match self.mailbox.list_history(token, start).await {
            Ok(page) if !page.is_empty() => {
                return AddedIds {
                    ids: page.message_ids,
                    complete: true,
                };
            }
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "History retry failed");
                false
            }
        };

        let ids = match self
            .mailbox
            .list_recent_inbox(token, self.config.recent_window, 1)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Recent inbox lookup failed");
                Vec::new()
            }
        };
        AddedIds { ids, complete }
    }

    async fn process_message(
        &self,
        user: &User,
        history_id: &str,
        message: &GmailMessage,
    ) -> Result<MatchOutcome, IngestError> {
        // Drafts are dropped before any body work.
        if message.has_label("DRAFT") {
            debug!(message_id = %message.id, "Draft skipped");
            return Ok(MatchOutcome::Skipped(SkipReason::Draft));
        }

        let mail = InboundMail::from_gmail(message);
        let notification = ReplyNotification {
            user_id: user.id.clone(),
            mailbox: user.email.clone(),
            history_id: Some(history_id.to_string()),
            provider_message_id: Some(mail.provider_message_id),
            thread_id: mail.thread_id,
            is_draft: false,
            is_sent_by_owner: message.has_label("SENT"),
            sender: mail.from,
            to: mail.to,
            cc: mail.cc,
            subject: mail.subject,
            body: mail.body,
            rfc_message_id: mail.rfc_message_id,
            references: mail.references,
        };
        self.matcher.match_and_record(&notification).await
    }

    /// Move the stored cursor forward, never back.
    async fn advance_cursor(&self, user: &User, history_id: &str) {
        if !is_newer_history_id(user.last_history_id.as_deref(), history_id) {
            return;
        }
        if let Err(e) = self.db.set_last_history_id(&user.id, history_id).await {
            warn!(user_id = %user.id, error = %e, "Failed to store history cursor");
        }
    }
}

fn is_newer_history_id(current: Option<&str>, candidate: &str) -> bool {
    let Ok(candidate) = candidate.parse::<u64>() else {
        return false;
    };
    match current.map(str::parse::<u64>) {
        Some(Ok(current)) => candidate > current,
        _ => true,
    }
}
