//! Generic SMTP relay, used when the user has no connected mailbox.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use super::{MailTransport, OutgoingEmail, SendReceipt, TransportKind};
use crate::config::RelayConfig;
use crate::error::TransportError;

const PROVIDER: &str = "relay";

pub struct SmtpRelayTransport {
    transport: Arc<SmtpTransport>,
    from_address: String,
}

impl SmtpRelayTransport {
    pub fn new(config: &RelayConfig) -> Result<Self, TransportError> {
        let mut builder = SmtpTransport::relay(&config.host)
            .map_err(|e| TransportError::Unavailable {
                provider: PROVIDER.into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ));
        }
        Ok(Self {
            transport: Arc::new(builder.build()),
            from_address: config.from_address.clone(),
        })
    }
}

fn map_smtp_error(e: lettre::transport::smtp::Error) -> TransportError {
    if e.is_permanent() {
        TransportError::Rejected {
            provider: PROVIDER.into(),
            status: e
                .status()
                .and_then(|code| code.to_string().parse().ok())
                .unwrap_or(0),
            reason: e.to_string(),
        }
    } else {
        TransportError::Unavailable {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl MailTransport for SmtpRelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<SendReceipt, TransportError> {
        // The relay can only vouch for its own sender address.
        let mut email = email.clone();
        if !self.from_address.is_empty() {
            email.from = self.from_address.clone();
        }
        let message = email.to_message()?;
        let recipients = email.to.len() + email.cc.len();

        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| TransportError::Unavailable {
                provider: PROVIDER.into(),
                reason: format!("send task failed: {e}"),
            })?
            .map_err(map_smtp_error)?;

        info!(recipients, "Relayed message via SMTP");
        Ok(SendReceipt {
            thread_id: None,
            provider_message_id: None,
        })
    }
}
