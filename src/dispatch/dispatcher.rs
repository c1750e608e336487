//! Delivers one scheduled send: transport selection, threading headers,
//! and the DRAFT/FAILED → SENT | FAILED transition.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::mail::html::clean_html_body;
use crate::mail::{ThreadHeaders, extract_address, generate_message_id, merge_references};
use crate::messages::{MessageStatus, OutboundMessage, ShortlistStatus};
use crate::oauth::{ProviderFamily, TokenSource, resolve_token};
use crate::queue::ScheduledSendJob;
use crate::store::Database;
use crate::transport::{MailTransport, OutgoingEmail, TransportFactory, TransportKind};

/// Result of one dispatch attempt, consumed by the worker.
#[derive(Debug)]
pub enum DispatchOutcome {
    Sent {
        transport: TransportKind,
        thread_id: Option<String>,
        provider_message_id: Option<String>,
    },
    Failed(DispatchError),
}

impl DispatchOutcome {
    #[cfg(test)]
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

pub struct Dispatcher {
    db: Arc<dyn Database>,
    tokens: Arc<dyn TokenSource>,
    transports: Arc<dyn TransportFactory>,
    message_id_domain: String,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        tokens: Arc<dyn TokenSource>,
        transports: Arc<dyn TransportFactory>,
        message_id_domain: impl Into<String>,
    ) -> Self {
        Self {
            db,
            tokens,
            transports,
            message_id_domain: message_id_domain.into(),
        }
    }

    pub async fn dispatch(&self, job: &ScheduledSendJob) -> DispatchOutcome {
        match self.deliver(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                match &e {
                    // Nothing to mark, or a row we must not touch.
                    DispatchError::MessageNotFound { .. } | DispatchError::NotSendable { .. } => {
                        warn!(message_id = %job.message_id, error = %e, "Send job dropped");
                    }
                    _ => {
                        error!(message_id = %job.message_id, error = %e, "Send failed");
                        self.mark_failed(job.message_id).await;
                    }
                }
                DispatchOutcome::Failed(e)
            }
        }
    }

    /// Persist FAILED, logging store errors.
    pub async fn mark_failed(&self, message_id: Uuid) {
        if let Err(e) = self
            .db
            .update_message_status(message_id, MessageStatus::Failed)
            .await
        {
            error!(message_id = %message_id, error = %e, "Failed to mark message FAILED");
        }
    }

    async fn deliver(&self, job: &ScheduledSendJob) -> Result<DispatchOutcome, DispatchError> {
        let message = self
            .db
            .get_message(job.message_id)
            .await?
            .ok_or(DispatchError::MessageNotFound { id: job.message_id })?;
        if !message.status.is_sendable() {
            return Err(DispatchError::NotSendable {
                id: message.id,
                status: message.status.to_string(),
            });
        }

        // Read-only context; the message never takes over its identity.
        let previous = match message.previous_message_id {
            Some(prev_id) => {
                let prev = self.db.get_message(prev_id).await?;
                if prev.is_none() {
                    warn!(message_id = %message.id, previous = %prev_id, "Previous message missing");
                }
                prev
            }
            None => None,
        };

        let thread_id = previous
            .as_ref()
            .and_then(|p| p.thread_id.clone())
            .or_else(|| job.thread_id.clone())
            .or_else(|| message.thread_id.clone());
        let references = previous.as_ref().and_then(|p| {
            merge_references(&[p.gmail_references.as_deref(), p.gmail_message_id.as_deref()])
        });

        let transport = self.select_transport(&message.user_id).await?;
        let email = OutgoingEmail {
            from: message.from_address.clone(),
            to: normalize_recipients(&job.to)?,
            cc: normalize_recipients(&job.cc)?,
            subject: job.subject.clone(),
            html_body: clean_html_body(&job.body),
            headers: ThreadHeaders::for_reply(
                generate_message_id(&self.message_id_domain),
                references,
            ),
            thread_id: thread_id.filter(|_| transport.supports_threads()),
            attachments: job.attachments.clone(),
        };

        debug!(
            message_id = %message.id,
            transport = %transport.kind(),
            rfc_message_id = %email.headers.message_id,
            reply = email.headers.is_reply(),
            references = ?email.headers.references,
            "Sending message"
        );
        let receipt = transport.send(&email).await?;
        info!(
            message_id = %message.id,
            transport = %transport.kind(),
            thread_id = ?receipt.thread_id,
            "Message sent"
        );

        self.record_sent(&message).await;

        Ok(DispatchOutcome::Sent {
            transport: transport.kind(),
            thread_id: receipt.thread_id,
            provider_message_id: receipt.provider_message_id,
        })
    }

    /// Gmail token, then Microsoft token, then the relay.
    pub async fn select_transport(
        &self,
        user_id: &str,
    ) -> Result<Arc<dyn MailTransport>, DispatchError> {
        if let Some(token) = resolve_token(self.tokens.as_ref(), user_id, ProviderFamily::Google).await
        {
            return Ok(self.transports.gmail(token.token));
        }
        if let Some(token) =
            resolve_token(self.tokens.as_ref(), user_id, ProviderFamily::Microsoft).await
        {
            return Ok(self.transports.graph(token.token));
        }
        debug!(user_id, "No mailbox credential, using relay");
        self.transports.relay().ok_or_else(|| DispatchError::NoTransport {
            user_id: user_id.to_string(),
        })
    }

    /// The mail is out: store errors here are logged, never turned into a
    /// failure that would resend it.
    async fn record_sent(&self, message: &OutboundMessage) {
        if let Err(e) = self
            .db
            .update_message_status(message.id, MessageStatus::Sent)
            .await
        {
            error!(message_id = %message.id, error = %e, "Failed to mark message SENT");
        }

        match self
            .db
            .get_shortlist(&message.user_id, &message.investor_id)
            .await
        {
            Ok(Some(entry)) if entry.status != ShortlistStatus::Contacted => {
                if let Err(e) = self
                    .db
                    .set_shortlist_status(
                        &message.user_id,
                        &message.investor_id,
                        ShortlistStatus::Contacted,
                    )
                    .await
                {
                    warn!(investor_id = %message.investor_id, error = %e, "Failed to advance shortlist");
                } else {
                    debug!(investor_id = %message.investor_id, "Shortlist marked contacted");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(investor_id = %message.investor_id, error = %e, "Shortlist lookup failed"),
        }
    }
}

fn normalize_recipients(raw: &[String]) -> Result<Vec<String>, DispatchError> {
    raw.iter()
        .filter(|r| !r.trim().is_empty())
        .map(|r| extract_address(r).ok_or_else(|| DispatchError::InvalidAddress(r.clone())))
        .collect()
}
