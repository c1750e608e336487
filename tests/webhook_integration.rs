//! Integration tests for the Gmail push webhook.
//!
//! Each test spins up the Axum app on a random port with an in-memory
//! database and a scripted mailbox, posts Pub/Sub envelopes with reqwest,
//! and checks what landed in the store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use secrecy::SecretString;
use tokio::net::TcpListener;

use fundmail::api::{self, AppState};
use fundmail::config::IngestConfig;
use fundmail::dispatch::Scheduler;
use fundmail::error::{TokenError, TransportError};
use fundmail::ingest::NotificationIngestor;
use fundmail::messages::{DraftFields, MessageStatus, OutboundMessage, User};
use fundmail::oauth::{AccessToken, TokenSource};
use fundmail::queue::{InMemoryQueue, RetryPolicy};
use fundmail::store::{Database, LibSqlBackend};
use fundmail::transport::gmail::{GmailBody, GmailHeader};
use fundmail::transport::{GmailMessage, GmailPayload, HistoryPage, MailboxReader, WatchResponse};

// ── Stubs ───────────────────────────────────────────────────────────

struct GoogleToken;

#[async_trait]
impl TokenSource for GoogleToken {
    async fn get_access_token(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<AccessToken, TokenError> {
        if provider == "google" {
            Ok(AccessToken::new("tok"))
        } else {
            Err(TokenError::Unavailable {
                provider: provider.into(),
                user_id: user_id.into(),
            })
        }
    }
}

/// Mailbox with scripted history responses.
#[derive(Default)]
struct ScriptedMailbox {
    history: Mutex<VecDeque<Result<HistoryPage, TransportError>>>,
    messages: Mutex<HashMap<String, GmailMessage>>,
    recent: Mutex<Vec<String>>,
    history_starts: Mutex<Vec<String>>,
    watch_calls: AtomicUsize,
}

impl ScriptedMailbox {
    fn push_history(&self, page: Result<HistoryPage, TransportError>) {
        self.history.lock().unwrap().push_back(page);
    }

    fn add_message(&self, message: GmailMessage) {
        self.messages
            .lock()
            .unwrap()
            .insert(message.id.clone(), message);
    }
}

#[async_trait]
impl MailboxReader for ScriptedMailbox {
    async fn get_message(
        &self,
        _token: &SecretString,
        message_id: &str,
    ) -> Result<GmailMessage, TransportError> {
        self.messages
            .lock()
            .unwrap()
            .get(message_id)
            .cloned()
            .ok_or_else(|| TransportError::Rejected {
                provider: "gmail".into(),
                status: 404,
                reason: "not found".into(),
            })
    }

    async fn list_history(
        &self,
        _token: &SecretString,
        start_history_id: &str,
    ) -> Result<HistoryPage, TransportError> {
        self.history_starts
            .lock()
            .unwrap()
            .push(start_history_id.to_string());
        self.history
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(HistoryPage::default()))
    }

    async fn list_recent_inbox(
        &self,
        _token: &SecretString,
        _window: Duration,
        max: usize,
    ) -> Result<Vec<String>, TransportError> {
        Ok(self.recent.lock().unwrap().iter().take(max).cloned().collect())
    }

    async fn watch(&self, _token: &SecretString) -> Result<WatchResponse, TransportError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(WatchResponse {
            history_id: Some("999".into()),
            expiration: None,
        })
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct TestApp {
    base: String,
    db: Arc<LibSqlBackend>,
    mailbox: Arc<ScriptedMailbox>,
    original: OutboundMessage,
    http: reqwest::Client,
}

async fn start_app() -> TestApp {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    db.upsert_user(&User::new("u1", "bob@us.com")).await.unwrap();

    let mut original = OutboundMessage::draft(
        "u1",
        "inv1",
        DraftFields {
            to: vec!["alice@corp.com".into()],
            subject: "Intro".into(),
            from_address: "bob@us.com".into(),
            body: "<p>Hi Alice</p>".into(),
            ..Default::default()
        },
    );
    original.status = MessageStatus::Sent;
    db.insert_message(&original).await.unwrap();

    let mailbox = Arc::new(ScriptedMailbox::default());
    let ingestor = Arc::new(NotificationIngestor::new(
        db.clone(),
        Arc::new(GoogleToken),
        mailbox.clone(),
        IngestConfig::default(),
    ));
    let state = AppState {
        db: db.clone(),
        ingestor,
        scheduler: Arc::new(Scheduler::new(
            db.clone(),
            Arc::new(InMemoryQueue::new(RetryPolicy::default())),
        )),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = api::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestApp {
        base: format!("http://127.0.0.1:{port}"),
        db,
        mailbox,
        original,
        http: reqwest::Client::new(),
    }
}

impl TestApp {
    async fn push(&self, payload: serde_json::Value) -> reqwest::StatusCode {
        let data = STANDARD.encode(payload.to_string());
        self.push_raw(serde_json::json!({
            "message": {"data": data, "messageId": "1"},
            "subscription": "projects/p/subscriptions/gmail"
        })
        .to_string())
        .await
    }

    async fn push_raw(&self, body: String) -> reqwest::StatusCode {
        self.http
            .post(format!("{}/webhooks/gmail", self.base))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap()
            .status()
    }

    async fn answered(&self) -> Vec<OutboundMessage> {
        self.db
            .list_messages_for_investor("u1", "inv1")
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.status == MessageStatus::Answered)
            .collect()
    }
}

fn reply_message(id: &str, from: &str, labels: &[&str], text: &str) -> GmailMessage {
    GmailMessage {
        id: id.into(),
        thread_id: Some("t-1".into()),
        label_ids: labels.iter().map(|l| l.to_string()).collect(),
        history_id: None,
        payload: Some(GmailPayload {
            mime_type: Some("text/plain".into()),
            headers: vec![
                GmailHeader {
                    name: "From".into(),
                    value: from.into(),
                },
                GmailHeader {
                    name: "To".into(),
                    value: "Bob <bob@us.com>".into(),
                },
                GmailHeader {
                    name: "Subject".into(),
                    value: "Re: Intro".into(),
                },
            ],
            body: Some(GmailBody {
                size: None,
                data: Some(URL_SAFE.encode(text)),
            }),
            parts: vec![],
        }),
        raw: None,
    }
}

const REPLY_TEXT: &str =
    "Thanks!\nOn Fri, Oct 17, 2025 at 10:24 AM Bob <bob@us.com> wrote:\n> Hi Alice";

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn embedded_reply_is_recorded_once() {
    let app = start_app().await;
    let message = reply_message("g-1", "Alice <alice@corp.com>", &["INBOX"], REPLY_TEXT);
    let payload = serde_json::json!({
        "emailAddress": "bob@us.com",
        "historyId": 1200,
        "message": message,
    });

    assert_eq!(app.push(payload.clone()).await, 200);
    assert_eq!(app.push(payload).await, 200);

    let answered = app.answered().await;
    assert_eq!(answered.len(), 1);
    let row = &answered[0];
    assert_eq!(row.from_address, "alice@corp.com");
    assert_eq!(row.body, "Thanks!");
    assert_eq!(row.previous_message_id, Some(app.original.id));
    assert_eq!(row.provider_message_id.as_deref(), Some("g-1"));
}

#[tokio::test]
async fn ping_fetches_history_and_advances_cursor() {
    let app = start_app().await;
    app.mailbox.add_message(reply_message(
        "g-2",
        "alice@corp.com",
        &["INBOX", "UNREAD"],
        REPLY_TEXT,
    ));
    app.mailbox.push_history(Ok(HistoryPage {
        message_ids: vec!["g-2".into()],
        history_id: Some("1300".into()),
    }));

    let status = app
        .push(serde_json::json!({"emailAddress": "Bob@US.com", "historyId": "1300"}))
        .await;
    assert_eq!(status, 200);

    assert_eq!(app.answered().await.len(), 1);
    // No stored cursor yet, so history starts at the notification's id.
    assert_eq!(*app.mailbox.history_starts.lock().unwrap(), vec!["1300"]);
    let user = app.db.get_user("u1").await.unwrap().unwrap();
    assert_eq!(user.last_history_id.as_deref(), Some("1300"));
}

#[tokio::test]
async fn stored_cursor_is_the_history_start() {
    let app = start_app().await;
    app.db.set_last_history_id("u1", "1100").await.unwrap();
    app.mailbox.push_history(Ok(HistoryPage::default()));

    app.push(serde_json::json!({"emailAddress": "bob@us.com", "historyId": "1400"}))
        .await;

    assert_eq!(app.mailbox.history_starts.lock().unwrap()[0], "1100");
}

#[tokio::test]
async fn auth_scope_error_resubscribes_and_retries() {
    let app = start_app().await;
    app.mailbox.add_message(reply_message("g-3", "alice@corp.com", &["INBOX"], REPLY_TEXT));
    app.mailbox.push_history(Err(TransportError::AuthScope {
        provider: "gmail".into(),
        reason: "insufficientPermissions".into(),
    }));
    app.mailbox.push_history(Ok(HistoryPage {
        message_ids: vec!["g-3".into()],
        history_id: None,
    }));

    let status = app
        .push(serde_json::json!({"emailAddress": "bob@us.com", "historyId": "1500"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(app.mailbox.watch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(app.answered().await.len(), 1);
}

#[tokio::test]
async fn empty_history_falls_back_to_recent_inbox() {
    let app = start_app().await;
    app.mailbox.add_message(reply_message("g-4", "alice@corp.com", &["INBOX"], REPLY_TEXT));
    app.mailbox.recent.lock().unwrap().push("g-4".into());

    app.push(serde_json::json!({"emailAddress": "bob@us.com", "historyId": "1600"}))
        .await;

    assert_eq!(app.mailbox.history_starts.lock().unwrap().len(), 2);
    assert_eq!(app.mailbox.watch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(app.answered().await.len(), 1);
}

#[tokio::test]
async fn other_history_errors_are_no_match() {
    let app = start_app().await;
    app.mailbox.push_history(Err(TransportError::Unavailable {
        provider: "gmail".into(),
        reason: "503".into(),
    }));

    let status = app
        .push(serde_json::json!({"emailAddress": "bob@us.com", "historyId": "1700"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(app.mailbox.watch_calls.load(Ordering::SeqCst), 0);
    assert!(app.answered().await.is_empty());
}

#[tokio::test]
async fn failed_history_keeps_cursor_for_replay() {
    let app = start_app().await;
    app.db.set_last_history_id("u1", "1000").await.unwrap();
    app.mailbox.push_history(Err(TransportError::Unavailable {
        provider: "gmail".into(),
        reason: "503".into(),
    }));

    let status = app
        .push(serde_json::json!({"emailAddress": "bob@us.com", "historyId": "1300"}))
        .await;
    assert_eq!(status, 200);
    let user = app.db.get_user("u1").await.unwrap().unwrap();
    assert_eq!(user.last_history_id.as_deref(), Some("1000"));

    // The next push replays from the kept cursor and picks the reply up.
    app.mailbox.add_message(reply_message("g-8", "alice@corp.com", &["INBOX"], REPLY_TEXT));
    app.mailbox.push_history(Ok(HistoryPage {
        message_ids: vec!["g-8".into()],
        history_id: Some("1400".into()),
    }));
    app.push(serde_json::json!({"emailAddress": "bob@us.com", "historyId": "1400"}))
        .await;

    assert_eq!(*app.mailbox.history_starts.lock().unwrap(), vec!["1000", "1000"]);
    assert_eq!(app.answered().await.len(), 1);
    let user = app.db.get_user("u1").await.unwrap().unwrap();
    assert_eq!(user.last_history_id.as_deref(), Some("1400"));
}

#[tokio::test]
async fn unfetchable_message_keeps_cursor() {
    let app = start_app().await;
    app.db.set_last_history_id("u1", "1000").await.unwrap();
    app.mailbox.push_history(Ok(HistoryPage {
        message_ids: vec!["g-gone".into()],
        history_id: Some("1300".into()),
    }));

    app.push(serde_json::json!({"emailAddress": "bob@us.com", "historyId": "1300"}))
        .await;

    let user = app.db.get_user("u1").await.unwrap().unwrap();
    assert_eq!(user.last_history_id.as_deref(), Some("1000"));
}

#[tokio::test]
async fn missing_history_id_is_skipped() {
    let app = start_app().await;
    let message = reply_message("g-5", "alice@corp.com", &["INBOX"], REPLY_TEXT);

    let status = app
        .push(serde_json::json!({"emailAddress": "bob@us.com", "message": message}))
        .await;
    assert_eq!(status, 200);
    assert!(app.answered().await.is_empty());
    assert!(app.mailbox.history_starts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn drafts_and_own_mail_are_skipped() {
    let app = start_app().await;

    let draft = reply_message("g-6", "alice@corp.com", &["DRAFT"], REPLY_TEXT);
    app.push(serde_json::json!({"emailAddress": "bob@us.com", "historyId": 1, "message": draft}))
        .await;

    let own = reply_message("g-7", "bob@us.com", &["SENT"], "Following up");
    app.push(serde_json::json!({"emailAddress": "bob@us.com", "historyId": 2, "message": own}))
        .await;

    assert!(app.answered().await.is_empty());
}

#[tokio::test]
async fn garbage_and_unknown_mailboxes_are_acknowledged() {
    let app = start_app().await;

    assert_eq!(app.push_raw("not json".into()).await, 200);
    assert_eq!(
        app.push_raw(r#"{"message":{"data":"%%%"}}"#.into()).await,
        200
    );
    let status = app
        .push(serde_json::json!({"emailAddress": "nobody@else.com", "historyId": "5"}))
        .await;
    assert_eq!(status, 200);
    assert!(app.mailbox.history_starts.lock().unwrap().is_empty());
}
