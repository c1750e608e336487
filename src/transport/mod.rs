//! Mail provider transports.
//!
//! Sending goes through [`MailTransport`]; a per-user transport is picked by
//! credential availability (Gmail → Graph → SMTP relay). Inbound fetches go
//! through [`MailboxReader`], implemented by the Gmail client.

pub mod gmail;
pub mod graph;
pub mod outgoing;
pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::TransportError;

pub use gmail::{GmailClient, GmailMessage, GmailPayload, GmailTransport, HistoryPage, WatchResponse};
pub use graph::GraphTransport;
pub use outgoing::{JobAttachment, OutgoingEmail};
pub use relay::SmtpRelayTransport;

/// Which transport delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Gmail,
    Graph,
    Relay,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Graph => "graph",
            Self::Relay => "relay",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider response to a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub thread_id: Option<String>,
    pub provider_message_id: Option<String>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether `OutgoingEmail::thread_id` is honoured.
    fn supports_threads(&self) -> bool {
        false
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<SendReceipt, TransportError>;
}

/// Builds per-user transports once a credential is known.
pub trait TransportFactory: Send + Sync {
    fn gmail(&self, token: SecretString) -> Arc<dyn MailTransport>;
    fn graph(&self, token: SecretString) -> Arc<dyn MailTransport>;
    /// `None` when no relay is configured.
    fn relay(&self) -> Option<Arc<dyn MailTransport>>;
}

/// Read access to a connected mailbox.
#[async_trait]
pub trait MailboxReader: Send + Sync {
    async fn get_message(
        &self,
        token: &SecretString,
        message_id: &str,
    ) -> Result<GmailMessage, TransportError>;

    /// Message ids added since `start_history_id`.
    async fn list_history(
        &self,
        token: &SecretString,
        start_history_id: &str,
    ) -> Result<HistoryPage, TransportError>;

    /// Ids of inbox messages newer than `window`, newest first.
    async fn list_recent_inbox(
        &self,
        token: &SecretString,
        window: Duration,
        max: usize,
    ) -> Result<Vec<String>, TransportError>;

    /// Re-establish the push subscription.
    async fn watch(&self, token: &SecretString) -> Result<WatchResponse, TransportError>;
}

/// Production factory backed by the HTTP clients and an optional relay.
pub struct HttpTransports {
    gmail: GmailClient,
    graph_api_base: String,
    relay: Option<Arc<dyn MailTransport>>,
}

impl HttpTransports {
    pub fn new(
        gmail: GmailClient,
        graph_api_base: String,
        relay: Option<Arc<dyn MailTransport>>,
    ) -> Self {
        Self {
            gmail,
            graph_api_base,
            relay,
        }
    }
}

impl TransportFactory for HttpTransports {
    fn gmail(&self, token: SecretString) -> Arc<dyn MailTransport> {
        Arc::new(GmailTransport::new(self.gmail.clone(), token))
    }

    fn graph(&self, token: SecretString) -> Arc<dyn MailTransport> {
        Arc::new(GraphTransport::new(self.graph_api_base.clone(), token))
    }

    fn relay(&self) -> Option<Arc<dyn MailTransport>> {
        self.relay.clone()
    }
}

/// Map a non-success provider response to a transport error.
pub(crate) fn classify_status(
    provider: &str,
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> TransportError {
    let reason: String = body.chars().take(200).collect();
    match status.as_u16() {
        401 | 403 => TransportError::AuthScope {
            provider: provider.to_string(),
            reason,
        },
        429 => TransportError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        500..=599 => TransportError::Unavailable {
            provider: provider.to_string(),
            reason: format!("{status}: {reason}"),
        },
        code => TransportError::Rejected {
            provider: provider.to_string(),
            status: code,
            reason,
        },
    }
}

pub(crate) fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status("gmail", StatusCode::FORBIDDEN, None, "insufficient").is_auth_scope());
        assert!(classify_status("gmail", StatusCode::UNAUTHORIZED, None, "").is_auth_scope());

        let limited = classify_status("graph", StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(5)), "");
        assert!(limited.is_retryable());

        let down = classify_status("graph", StatusCode::BAD_GATEWAY, None, "oops");
        assert!(down.is_retryable());

        let bad = classify_status("gmail", StatusCode::BAD_REQUEST, None, "invalid raw");
        assert!(!bad.is_retryable());
        assert!(matches!(bad, TransportError::Rejected { status: 400, .. }));
    }
}
