//! Reply matching: find the SENT message an inbound reply answers and record
//! it as ANSWERED exactly once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, IngestError};
use crate::mail::address::{candidate_variants, unique_lowercase};
use crate::mail::{CandidateSet, build_candidate_set};
use crate::messages::{AnsweredReply, OutboundMessage};
use crate::store::{AnsweredKey, Database, SentMessageQuery};

/// Why a notification was not matched at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Undecodable,
    MissingHistoryId,
    UnknownMailbox,
    Draft,
    MissingSender,
    SelfAuthored,
    MissingRecipients,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undecodable => "undecodable",
            Self::MissingHistoryId => "missing_history_id",
            Self::UnknownMailbox => "unknown_mailbox",
            Self::Draft => "draft",
            Self::MissingSender => "missing_sender",
            Self::SelfAuthored => "self_authored",
            Self::MissingRecipients => "missing_recipients",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Created(Uuid),
    AlreadyExists(Uuid),
    NoMatch,
    Skipped(SkipReason),
}

/// One inbound reply, decoded and attributed to a watched mailbox.
#[derive(Debug, Clone, Default)]
pub struct ReplyNotification {
    pub user_id: String,
    /// The watched mailbox address.
    pub mailbox: String,
    pub history_id: Option<String>,
    pub provider_message_id: Option<String>,
    pub thread_id: Option<String>,
    pub is_draft: bool,
    /// Flagged as sent by the mailbox owner at the provider.
    pub is_sent_by_owner: bool,
    pub sender: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub rfc_message_id: Option<String>,
    pub references: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchPath {
    Primary,
    Fallback,
}

/// Normalized candidate sets, alive for one match call.
struct ReplyCandidate<'a> {
    sender: CandidateSet,
    recipients: Vec<CandidateSet>,
    notification: &'a ReplyNotification,
}

pub struct ReplyMatcher {
    db: Arc<dyn Database>,
    fallback_dedup_window: Duration,
}

impl ReplyMatcher {
    pub fn new(db: Arc<dyn Database>, fallback_dedup_window: Duration) -> Self {
        Self {
            db,
            fallback_dedup_window,
        }
    }

    pub async fn match_and_record(
        &self,
        notification: &ReplyNotification,
    ) -> Result<MatchOutcome, IngestError> {
        let candidate = match prepare(notification) {
            Ok(c) => c,
            Err(reason) => {
                debug!(
                    provider_message_id = ?notification.provider_message_id,
                    reason = reason.as_str(),
                    "Reply skipped"
                );
                return Ok(MatchOutcome::Skipped(reason));
            }
        };

        let Some((original, path)) = self.find_original(&candidate).await? else {
            info!(
                user_id = %notification.user_id,
                sender = ?notification.sender,
                subject = %notification.subject,
                "No sent message matches reply"
            );
            return Ok(MatchOutcome::NoMatch);
        };

        if let Some(existing) = self.find_duplicate(&candidate, &original, path).await? {
            debug!(answered_id = %existing, original_id = %original.id, "Reply already recorded");
            return Ok(MatchOutcome::AlreadyExists(existing));
        }

        let answered = OutboundMessage::answered(
            &original,
            AnsweredReply {
                from_address: candidate.sender.lower.clone(),
                to: recipient_list(&candidate),
                cc: unique_lowercase(notification.cc.iter().map(String::as_str)),
                subject: notification.subject.clone(),
                body: notification.body.clone(),
                thread_id: notification.thread_id.clone(),
                rfc_message_id: notification.rfc_message_id.clone(),
                references: notification.references.clone(),
                provider_message_id: notification.provider_message_id.clone(),
            },
        );

        match self.db.insert_message(&answered).await {
            Ok(()) => {
                info!(
                    answered_id = %answered.id,
                    original_id = %original.id,
                    investor_id = %original.investor_id,
                    path = ?path,
                    "Reply recorded"
                );
                Ok(MatchOutcome::Created(answered.id))
            }
            // A concurrent delivery of the same push won the insert.
            Err(DatabaseError::Constraint(reason)) => {
                let existing = match notification.provider_message_id.as_deref() {
                    Some(pid) => self.db.find_answered_by_provider_id(pid).await?,
                    None => None,
                };
                match existing {
                    Some(row) => Ok(MatchOutcome::AlreadyExists(row.id)),
                    None => Err(DatabaseError::Constraint(reason).into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Address match first; subject match only when it finds nothing.
    async fn find_original(
        &self,
        candidate: &ReplyCandidate<'_>,
    ) -> Result<Option<(OutboundMessage, MatchPath)>, DatabaseError> {
        let user_id = candidate.notification.user_id.clone();
        let from_any = candidate_variants(&candidate.recipients);

        let primary = SentMessageQuery {
            user_id: user_id.clone(),
            to_any: candidate
                .sender
                .variants()
                .into_iter()
                .map(str::to_string)
                .collect(),
            from_any: from_any.clone(),
            subject: None,
        };
        if let Some(found) = self.db.find_latest_sent(&primary).await? {
            return Ok(Some((found, MatchPath::Primary)));
        }

        let subject = strip_reply_prefix(&candidate.notification.subject);
        if subject.is_empty() {
            return Ok(None);
        }
        let fallback = SentMessageQuery {
            user_id,
            to_any: Vec::new(),
            from_any,
            subject: Some(subject.to_string()),
        };
        Ok(self
            .db
            .find_latest_sent(&fallback)
            .await?
            .map(|found| (found, MatchPath::Fallback)))
    }

    async fn find_duplicate(
        &self,
        candidate: &ReplyCandidate<'_>,
        original: &OutboundMessage,
        path: MatchPath,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let n = candidate.notification;
        if let Some(pid) = n.provider_message_id.as_deref()
            && let Some(row) = self.db.find_answered_by_provider_id(pid).await?
        {
            return Ok(Some(row.id));
        }

        let since = match path {
            MatchPath::Primary => None,
            MatchPath::Fallback => Some(
                Utc::now()
                    - chrono::Duration::from_std(self.fallback_dedup_window)
                        .unwrap_or_else(|_| chrono::Duration::hours(24)),
            ),
        };
        let key = AnsweredKey {
            user_id: &original.user_id,
            investor_id: &original.investor_id,
            from_address: &candidate.sender.lower,
            subject: &n.subject,
            body: &n.body,
            since,
        };
        Ok(self.db.find_answered(&key).await?.map(|row| row.id))
    }
}

/// Early rejection, then candidate sets. The watched mailbox always counts
/// as a recipient.
fn prepare(n: &ReplyNotification) -> Result<ReplyCandidate<'_>, SkipReason> {
    if n.history_id.as_deref().is_none_or(|h| h.trim().is_empty()) {
        return Err(SkipReason::MissingHistoryId);
    }
    if n.is_draft {
        return Err(SkipReason::Draft);
    }
    let sender = n
        .sender
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(SkipReason::MissingSender)?;
    if n.is_sent_by_owner || sender.eq_ignore_ascii_case(n.mailbox.trim()) {
        return Err(SkipReason::SelfAuthored);
    }
    if n.to.iter().all(|t| t.trim().is_empty()) {
        return Err(SkipReason::MissingRecipients);
    }

    let mut recipients: Vec<CandidateSet> = Vec::new();
    let mailbox = n.mailbox.trim();
    for addr in n.to.iter().map(|s| s.trim()).chain(std::iter::once(mailbox)) {
        if addr.is_empty() || recipients.iter().any(|r| r.matches(addr)) {
            continue;
        }
        recipients.push(build_candidate_set(addr));
    }

    Ok(ReplyCandidate {
        sender: build_candidate_set(sender),
        recipients,
        notification: n,
    })
}

fn recipient_list(candidate: &ReplyCandidate<'_>) -> Vec<String> {
    unique_lowercase(candidate.recipients.iter().map(|r| r.lower.as_str()))
}

/// `"Re: RE: Intro"` → `"Intro"`.
pub fn strip_reply_prefix(subject: &str) -> &str {
    let mut s = subject.trim();
    loop {
        let Some(prefix) = s.get(..3) else {
            return s;
        };
        if !prefix.eq_ignore_ascii_case("re:") {
            return s;
        }
        s = s[3..].trim_start();
    }
}
