//! Inbound message decoding: headers, addresses, and the fresh reply text.

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use mail_parser::MessageParser;

use crate::mail::html::{looks_like_html, strip_html};
use crate::mail::{extract_address, extract_addresses, extract_latest_reply};
use crate::transport::{GmailMessage, GmailPayload};

/// Decode standard or URL-safe base64, padded or not.
pub fn decode_base64(data: &str) -> Option<Vec<u8>> {
    let normalized: String = data
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    STANDARD_NO_PAD.decode(normalized).ok()
}

/// A received message, reduced to what reply matching needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMail {
    pub provider_message_id: String,
    pub thread_id: Option<String>,
    pub label_ids: Vec<String>,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub rfc_message_id: Option<String>,
    pub references: Option<String>,
    /// Newest reply only, quotes removed.
    pub body: String,
}

impl InboundMail {
    pub fn from_gmail(message: &GmailMessage) -> Self {
        let mut mail = Self {
            provider_message_id: message.id.clone(),
            thread_id: message.thread_id.clone(),
            label_ids: message.label_ids.clone(),
            ..Self::default()
        };

        if let Some(payload) = &message.payload {
            mail.from = payload.header("From").and_then(extract_address);
            mail.to = payload.header("To").map(extract_addresses).unwrap_or_default();
            mail.cc = payload.header("Cc").map(extract_addresses).unwrap_or_default();
            mail.subject = payload.header("Subject").unwrap_or_default().trim().to_string();
            mail.rfc_message_id = payload
                .header("Message-ID")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
            mail.references = payload
                .header("References")
                .map(|v| v.split_whitespace().collect::<Vec<_>>().join(" "))
                .filter(|v| !v.is_empty());
            if let Some(text) = payload_text(payload) {
                mail.body = text;
            }
        }

        if let Some(raw) = message.raw.as_deref().and_then(decode_base64) {
            mail.fill_from_raw(&raw);
        }
        mail
    }

    /// Fill whatever the structured payload left empty from RFC 822 source.
    fn fill_from_raw(&mut self, raw: &[u8]) {
        let Some(parsed) = MessageParser::default().parse(raw) else {
            return;
        };

        if self.from.is_none() {
            self.from = parsed
                .from()
                .and_then(|a| a.first())
                .and_then(|a| a.address())
                .map(str::to_string);
        }
        if self.to.is_empty() {
            self.to = parsed
                .to()
                .map(|a| a.iter().filter_map(|a| a.address()).map(str::to_string).collect())
                .unwrap_or_default();
        }
        if self.cc.is_empty() {
            self.cc = parsed
                .cc()
                .map(|a| a.iter().filter_map(|a| a.address()).map(str::to_string).collect())
                .unwrap_or_default();
        }
        if self.subject.is_empty() {
            self.subject = parsed.subject().unwrap_or_default().trim().to_string();
        }
        if self.rfc_message_id.is_none() {
            self.rfc_message_id = parsed.message_id().map(|id| format!("<{id}>"));
        }
        if self.body.is_empty() {
            if let Some(text) = parsed.body_text(0) {
                self.body = reply_text(&text, false);
            } else if let Some(html) = parsed.body_html(0) {
                self.body = reply_text(&html, true);
            }
        }
    }
}

/// Reply text of a payload: `text/plain` anywhere in the tree first, then
/// `text/html`.
fn payload_text(payload: &GmailPayload) -> Option<String> {
    if let Some(plain) = find_part(payload, "text/plain") {
        return Some(reply_text(&plain, false));
    }
    find_part(payload, "text/html").map(|html| reply_text(&html, true))
}

/// Depth-first search for the first part of `mime` with a decodable,
/// non-empty body.
fn find_part(payload: &GmailPayload, mime: &str) -> Option<String> {
    let is_mime = payload
        .mime_type
        .as_deref()
        .is_some_and(|m| m.eq_ignore_ascii_case(mime));
    if is_mime {
        let text = payload
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(decode_base64)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .filter(|t| !t.trim().is_empty());
        if text.is_some() {
            return text;
        }
    }
    payload.parts.iter().find_map(|part| find_part(part, mime))
}

fn reply_text(body: &str, html: bool) -> String {
    let latest = extract_latest_reply(body);
    if html || looks_like_html(&latest) {
        strip_html(&latest).trim().to_string()
    } else {
        latest
    }
}
