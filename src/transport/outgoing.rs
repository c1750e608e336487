//! Provider-neutral outgoing email and its RFC 5322 rendering.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use lettre::Message;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::mail::ThreadHeaders;
use crate::mail::html::strip_html;

/// A file riding along with a send job, content base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: String,
}

/// Everything a transport needs to deliver one message.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    /// Cleaned HTML body.
    pub html_body: String,
    pub headers: ThreadHeaders,
    /// Provider conversation key, only set for transports that group threads.
    pub thread_id: Option<String>,
    pub attachments: Vec<JobAttachment>,
}

fn mailbox(addr: &str) -> Result<Mailbox, TransportError> {
    addr.trim()
        .parse()
        .map_err(|e| TransportError::InvalidMessage(format!("bad address {addr:?}: {e}")))
}

impl OutgoingEmail {
    /// Build the MIME message with threading headers and a plain-text
    /// alternative.
    pub fn to_message(&self) -> Result<Message, TransportError> {
        if self.to.is_empty() {
            return Err(TransportError::InvalidMessage("no recipients".into()));
        }

        let mut builder = Message::builder()
            .from(mailbox(&self.from)?)
            .subject(self.subject.clone())
            .message_id(Some(self.headers.message_id.clone()));

        for to in &self.to {
            builder = builder.to(mailbox(to)?);
        }
        for cc in &self.cc {
            builder = builder.cc(mailbox(cc)?);
        }
        if let Some(parent) = &self.headers.in_reply_to {
            builder = builder.in_reply_to(parent.clone());
        }
        if let Some(refs) = &self.headers.references {
            builder = builder.references(refs.clone());
        }

        let body = MultiPart::alternative_plain_html(strip_html(&self.html_body), self.html_body.clone());

        let message = if self.attachments.is_empty() {
            builder.multipart(body)
        } else {
            let mut mixed = MultiPart::mixed().multipart(body);
            for att in &self.attachments {
                mixed = mixed.singlepart(attachment_part(att)?);
            }
            builder.multipart(mixed)
        };

        message.map_err(|e| TransportError::InvalidMessage(e.to_string()))
    }

    /// Serialized RFC 5322 bytes.
    pub fn to_rfc822(&self) -> Result<Vec<u8>, TransportError> {
        Ok(self.to_message()?.formatted())
    }
}

fn attachment_part(att: &JobAttachment) -> Result<SinglePart, TransportError> {
    let bytes = STANDARD
        .decode(att.data.trim())
        .map_err(|e| TransportError::InvalidMessage(format!("attachment {}: {e}", att.filename)))?;
    let content_type = ContentType::parse(&att.content_type).map_err(|e| {
        TransportError::InvalidMessage(format!("attachment {} content type: {e}", att.filename))
    })?;
    Ok(Attachment::new(att.filename.clone()).body(bytes, content_type))
}
