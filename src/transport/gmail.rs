//! Gmail REST API: send, fetch, history, recent inbox, and watch.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    MailTransport, MailboxReader, OutgoingEmail, SendReceipt, TransportKind, classify_status,
    retry_after,
};
use crate::config::GmailConfig;
use crate::error::TransportError;

const PROVIDER: &str = "gmail";

/// Upper bound on history pages followed per notification.
const MAX_HISTORY_PAGES: usize = 10;

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub history_id: Option<String>,
    #[serde(default)]
    pub payload: Option<GmailPayload>,
    /// Base64url RFC 822 source (`format=raw`).
    #[serde(default)]
    pub raw: Option<String>,
}

impl GmailMessage {
    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailPayload {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<GmailHeader>,
    #[serde(default)]
    pub body: Option<GmailBody>,
    #[serde(default)]
    pub parts: Vec<GmailPayload>,
}

impl GmailPayload {
    /// First header with this name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailBody {
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageStub,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
}

/// Added message ids from one history query, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    pub message_ids: Vec<String>,
    /// Mailbox history id at the time of the query.
    pub history_id: Option<String>,
}

impl HistoryPage {
    fn absorb(&mut self, resp: HistoryListResponse) {
        for record in resp.history {
            for added in record.messages_added {
                if !self.message_ids.contains(&added.message.id) {
                    self.message_ids.push(added.message.id);
                }
            }
        }
        if resp.history_id.is_some() {
            self.history_id = resp.history_id;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResponse {
    #[serde(default)]
    pub history_id: Option<String>,
    #[serde(default)]
    pub expiration: Option<String>,
}

/// JSON body for `messages.send`.
fn send_body(raw: &[u8], thread_id: Option<&str>) -> serde_json::Value {
    let mut body = serde_json::json!({ "raw": URL_SAFE_NO_PAD.encode(raw) });
    if let Some(thread_id) = thread_id {
        body["threadId"] = serde_json::Value::String(thread_id.to_string());
    }
    body
}

// ── Client ──────────────────────────────────────────────────────────

/// Stateless Gmail API client; the access token is passed per call.
#[derive(Clone)]
pub struct GmailClient {
    http: reqwest::Client,
    api_base: String,
    pubsub_topic: Option<String>,
}

impl GmailClient {
    pub fn new(config: &GmailConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            pubsub_topic: config.pubsub_topic.clone(),
        }
    }

    async fn execute(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let retry = retry_after(&resp);
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(PROVIDER, status, retry, &body))
    }

    async fn json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, TransportError> {
        resp.json().await.map_err(|e| TransportError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        })
    }

    pub async fn send_raw(
        &self,
        token: &SecretString,
        raw: &[u8],
        thread_id: Option<&str>,
    ) -> Result<SendReceipt, TransportError> {
        let url = format!("{}/users/me/messages/send", self.api_base);
        let resp = self
            .execute(
                self.http
                    .post(&url)
                    .bearer_auth(token.expose_secret())
                    .json(&send_body(raw, thread_id)),
            )
            .await?;
        let sent: SendResponse = Self::json(resp).await?;
        Ok(SendReceipt {
            thread_id: sent.thread_id,
            provider_message_id: Some(sent.id),
        })
    }
}

#[async_trait]
impl MailboxReader for GmailClient {
    async fn get_message(
        &self,
        token: &SecretString,
        message_id: &str,
    ) -> Result<GmailMessage, TransportError> {
        let url = format!("{}/users/me/messages/{}", self.api_base, message_id);
        let resp = self
            .execute(
                self.http
                    .get(&url)
                    .bearer_auth(token.expose_secret())
                    .query(&[("format", "full")]),
            )
            .await?;
        Self::json(resp).await
    }

    async fn list_history(
        &self,
        token: &SecretString,
        start_history_id: &str,
    ) -> Result<HistoryPage, TransportError> {
        let url = format!("{}/users/me/history", self.api_base);
        let mut page = HistoryPage::default();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_HISTORY_PAGES {
            let mut query: Vec<(&str, String)> = vec![
                ("startHistoryId", start_history_id.to_string()),
                ("historyTypes", "messageAdded".to_string()),
                ("labelId", "INBOX".to_string()),
            ];
            if let Some(pt) = &page_token {
                query.push(("pageToken", pt.clone()));
            }

            let result = self
                .execute(
                    self.http
                        .get(&url)
                        .bearer_auth(token.expose_secret())
                        .query(&query),
                )
                .await;

            let resp = match result {
                Ok(resp) => resp,
                // Start id older than the retained history window.
                Err(TransportError::Rejected { status: 404, .. }) => {
                    warn!(start_history_id, "Gmail history id expired");
                    return Ok(page);
                }
                Err(e) => return Err(e),
            };

            let body: HistoryListResponse = Self::json(resp).await?;
            page_token = body.next_page_token.clone();
            page.absorb(body);
            if page_token.is_none() {
                break;
            }
        }

        debug!(count = page.message_ids.len(), "Gmail history fetched");
        Ok(page)
    }

    async fn list_recent_inbox(
        &self,
        token: &SecretString,
        window: Duration,
        max: usize,
    ) -> Result<Vec<String>, TransportError> {
        let url = format!("{}/users/me/messages", self.api_base);
        let after = Utc::now().timestamp() - window.as_secs() as i64;
        let resp = self
            .execute(
                self.http
                    .get(&url)
                    .bearer_auth(token.expose_secret())
                    .query(&[
                        ("q", format!("in:inbox after:{after}")),
                        ("maxResults", max.to_string()),
                    ]),
            )
            .await?;
        let list: MessageListResponse = Self::json(resp).await?;
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn watch(&self, token: &SecretString) -> Result<WatchResponse, TransportError> {
        let Some(topic) = &self.pubsub_topic else {
            return Err(TransportError::Unavailable {
                provider: PROVIDER.into(),
                reason: "no Pub/Sub topic configured for watch".into(),
            });
        };
        let url = format!("{}/users/me/watch", self.api_base);
        let resp = self
            .execute(
                self.http
                    .post(&url)
                    .bearer_auth(token.expose_secret())
                    .json(&serde_json::json!({
                        "topicName": topic,
                        "labelIds": ["INBOX"],
                        "labelFilterBehavior": "include",
                    })),
            )
            .await?;
        let watch: WatchResponse = Self::json(resp).await?;
        info!(history_id = ?watch.history_id, "Gmail watch renewed");
        Ok(watch)
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// Sends as the user through their Gmail account.
pub struct GmailTransport {
    client: GmailClient,
    token: SecretString,
}

impl GmailTransport {
    pub fn new(client: GmailClient, token: SecretString) -> Self {
        Self { client, token }
    }
}

#[async_trait]
impl MailTransport for GmailTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Gmail
    }

    fn supports_threads(&self) -> bool {
        true
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<SendReceipt, TransportError> {
        let raw = email.to_rfc822()?;
        self.client
            .send_raw(&self.token, &raw, email.thread_id.as_deref())
            .await
    }
}
