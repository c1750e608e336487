//! Microsoft Graph `sendMail` transport.
//!
//! Posting the MIME source (base64, `text/plain`) instead of the JSON message
//! resource keeps our Message-ID and References headers intact.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::{MailTransport, OutgoingEmail, SendReceipt, TransportKind, classify_status, retry_after};
use crate::error::TransportError;

const PROVIDER: &str = "graph";

pub struct GraphTransport {
    http: reqwest::Client,
    api_base: String,
    token: SecretString,
}

impl GraphTransport {
    pub fn new(api_base: String, token: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn send_url(&self) -> String {
        format!("{}/me/sendMail", self.api_base)
    }
}

#[async_trait]
impl MailTransport for GraphTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Graph
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<SendReceipt, TransportError> {
        let raw = email.to_rfc822()?;
        let resp = self
            .http
            .post(self.send_url())
            .bearer_auth(self.token.expose_secret())
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(STANDARD.encode(raw))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry = retry_after(&resp);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(PROVIDER, status, retry, &body));
        }

        // 202 Accepted with an empty body; Graph assigns no id we can use.
        debug!(status = %status, "Graph accepted message");
        Ok(SendReceipt {
            thread_id: None,
            provider_message_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_has_no_threads() {
        let t = GraphTransport::new(
            "https://graph.example/v1.0/".into(),
            SecretString::from("tok".to_string()),
        );
        assert_eq!(t.kind(), TransportKind::Graph);
        assert!(!t.supports_threads());
        assert_eq!(t.send_url(), "https://graph.example/v1.0/me/sendMail");
    }
}
