//! Push envelope decoding.
//!
//! Pub/Sub delivers `{"message": {"data": <base64 JSON>, ...}}`. The inner
//! JSON names the mailbox and its history id, and may embed the message
//! itself; without it the notification is only a "something changed" ping.

use serde::{Deserialize, Deserializer};

use super::body::decode_base64;
use crate::transport::GmailMessage;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is not JSON: {0}")]
    Json(String),

    #[error("envelope has no data")]
    MissingData,

    #[error("envelope data is not base64")]
    Base64,

    #[error("notification payload is not JSON: {0}")]
    Payload(String),
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushPayload {
    #[serde(default)]
    email_address: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    history_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    message: Option<GmailMessage>,
}

/// What the notification carries.
#[derive(Debug, Clone)]
pub enum NotificationContent {
    Embedded(Box<GmailMessage>),
    Ping,
}

/// A decoded push notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub email_address: Option<String>,
    /// Freshness token.
    pub history_id: Option<String>,
    pub label_ids: Vec<String>,
    pub content: NotificationContent,
}

impl Notification {
    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

pub fn decode_push(body: &[u8]) -> Result<Notification, EnvelopeError> {
    let envelope: PushEnvelope =
        serde_json::from_slice(body).map_err(|e| EnvelopeError::Json(e.to_string()))?;
    let data = envelope
        .message
        .data
        .filter(|d| !d.trim().is_empty())
        .ok_or(EnvelopeError::MissingData)?;
    let decoded = decode_base64(&data).ok_or(EnvelopeError::Base64)?;
    let payload: PushPayload =
        serde_json::from_slice(&decoded).map_err(|e| EnvelopeError::Payload(e.to_string()))?;

    let content = match payload.message {
        Some(message) => NotificationContent::Embedded(Box::new(message)),
        None => NotificationContent::Ping,
    };
    Ok(Notification {
        email_address: payload
            .email_address
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty()),
        history_id: payload.history_id.filter(|h| !h.is_empty()),
        label_ids: payload.label_ids,
        content,
    })
}

/// History ids arrive as JSON numbers from Gmail and as strings elsewhere.
fn string_or_number<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(de)? {
        Some(serde_json::Value::String(s)) => Some(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
