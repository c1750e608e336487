//! End-to-end outbound tests: schedule a draft, let the worker pick it up,
//! and check which transport delivered it and what the store ends up with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use uuid::Uuid;

use fundmail::config::DispatchConfig;
use fundmail::dispatch::{Dispatcher, Scheduler, spawn_dispatch_worker};
use fundmail::error::{TokenError, TransportError};
use fundmail::messages::{AnsweredReply, DraftFields, MessageStatus, OutboundMessage, ShortlistStatus};
use fundmail::oauth::{AccessToken, TokenSource};
use fundmail::queue::{InMemoryQueue, JobQueue, JobState, RetryPolicy};
use fundmail::store::{Database, LibSqlBackend};
use fundmail::transport::{
    MailTransport, OutgoingEmail, SendReceipt, TransportFactory, TransportKind,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ── Stubs ───────────────────────────────────────────────────────────

/// Broker that only knows the listed provider names.
struct Tokens(&'static [&'static str]);

#[async_trait]
impl TokenSource for Tokens {
    async fn get_access_token(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<AccessToken, TokenError> {
        if self.0.contains(&provider) {
            Ok(AccessToken::new(format!("{provider}-token")))
        } else {
            Err(TokenError::Unavailable {
                provider: provider.into(),
                user_id: user_id.into(),
            })
        }
    }
}

/// Transport that records what it was asked to send.
struct Recorder {
    kind: TransportKind,
    sent: Mutex<Vec<OutgoingEmail>>,
}

impl Recorder {
    fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for Recorder {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn supports_threads(&self) -> bool {
        self.kind == TransportKind::Gmail
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<SendReceipt, TransportError> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(SendReceipt {
            thread_id: email.thread_id.clone(),
            provider_message_id: Some(format!("{}-1", self.kind)),
        })
    }
}

struct Transports {
    gmail: Arc<Recorder>,
    graph: Arc<Recorder>,
    relay: Arc<Recorder>,
}

impl TransportFactory for Transports {
    fn gmail(&self, _token: SecretString) -> Arc<dyn MailTransport> {
        self.gmail.clone()
    }
    fn graph(&self, _token: SecretString) -> Arc<dyn MailTransport> {
        self.graph.clone()
    }
    fn relay(&self) -> Option<Arc<dyn MailTransport>> {
        Some(self.relay.clone())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Outbound {
    db: Arc<LibSqlBackend>,
    queue: Arc<InMemoryQueue>,
    scheduler: Scheduler,
    transports: Arc<Transports>,
    shutdown: Arc<AtomicBool>,
}

fn config() -> DispatchConfig {
    DispatchConfig {
        concurrency: 2,
        max_attempts: 2,
        backoff_base: Duration::from_millis(20),
        send_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(10),
    }
}

async fn start(tokens: &'static [&'static str]) -> Outbound {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let queue = Arc::new(InMemoryQueue::new(RetryPolicy::from_config(&config())));
    let transports = Arc::new(Transports {
        gmail: Recorder::new(TransportKind::Gmail),
        graph: Recorder::new(TransportKind::Graph),
        relay: Recorder::new(TransportKind::Relay),
    });
    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        Arc::new(Tokens(tokens)),
        transports.clone(),
        "fundmail.test",
    ));
    let (_handle, shutdown) =
        spawn_dispatch_worker(dispatcher, queue.clone(), db.clone(), config());

    Outbound {
        scheduler: Scheduler::new(db.clone(), queue.clone()),
        db,
        queue,
        transports,
        shutdown,
    }
}

impl Outbound {
    async fn draft(&self, previous: Option<Uuid>) -> Uuid {
        self.db
            .save_draft(
                "u1",
                "inv1",
                DraftFields {
                    to: vec!["Alice <Alice@Corp.com>".into()],
                    subject: "Re: Intro".into(),
                    from_address: "bob@us.com".into(),
                    body: "<p>Following up</p>".into(),
                    previous_message_id: previous,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id
    }

    /// Wait until the worker has sent the message and cleared its schedule.
    async fn wait_until_sent(&self, id: Uuid) -> OutboundMessage {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let message = self.db.get_message(id).await.unwrap().unwrap();
                if message.status == MessageStatus::Sent && message.scheduled_at.is_none() {
                    return message;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message was never sent")
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn gmail_send_continues_the_thread() {
    let out = start(&["google"]).await;

    let mut previous = OutboundMessage::draft(
        "u1",
        "inv1",
        DraftFields {
            to: vec!["alice@corp.com".into()],
            subject: "Intro".into(),
            from_address: "bob@us.com".into(),
            body: "<p>Hi</p>".into(),
            thread_id: Some("t-9".into()),
            ..Default::default()
        },
    );
    previous.status = MessageStatus::Sent;
    previous.gmail_message_id = Some("<m2>".into());
    previous.gmail_references = Some("<m1>".into());
    out.db.insert_message(&previous).await.unwrap();
    out.db
        .set_shortlist_status("u1", "inv1", ShortlistStatus::Shortlisted)
        .await
        .unwrap();

    let id = out.draft(Some(previous.id)).await;
    out.scheduler
        .schedule_send(id, Duration::ZERO, vec![])
        .await
        .unwrap();

    out.wait_until_sent(id).await;

    let emails = out.transports.gmail.sent();
    assert_eq!(emails.len(), 1);
    let email = &emails[0];
    assert_eq!(email.to, vec!["Alice@Corp.com"]);
    assert_eq!(email.thread_id.as_deref(), Some("t-9"));
    assert_eq!(email.headers.references.as_deref(), Some("<m1> <m2>"));
    assert_eq!(email.headers.in_reply_to.as_deref(), Some("<m2>"));
    assert!(email.headers.message_id.ends_with("@fundmail.test>"));
    assert!(out.transports.relay.sent().is_empty());

    // The earlier message is untouched.
    let previous_after = out.db.get_message(previous.id).await.unwrap().unwrap();
    assert_eq!(previous_after.status, MessageStatus::Sent);
    assert_eq!(previous_after.gmail_message_id.as_deref(), Some("<m2>"));
    assert_eq!(previous_after.gmail_references.as_deref(), Some("<m1>"));

    let shortlist = out.db.get_shortlist("u1", "inv1").await.unwrap().unwrap();
    assert_eq!(shortlist.status, ShortlistStatus::Contacted);

    let completed = out.queue.jobs_by_state(JobState::Completed).await;
    assert_eq!(completed.len(), 1);
}

#[tokio::test]
async fn follow_up_to_answered_reply_carries_full_chain() {
    let out = start(&["google"]).await;

    let mut sent = OutboundMessage::draft(
        "u1",
        "inv1",
        DraftFields {
            to: vec!["alice@corp.com".into()],
            subject: "Intro".into(),
            from_address: "bob@us.com".into(),
            thread_id: Some("t-9".into()),
            ..Default::default()
        },
    );
    sent.status = MessageStatus::Sent;
    sent.gmail_message_id = Some("<m2>".into());
    sent.gmail_references = Some("<m1>".into());
    out.db.insert_message(&sent).await.unwrap();

    let answered = OutboundMessage::answered(
        &sent,
        AnsweredReply {
            from_address: "alice@corp.com".into(),
            to: vec!["bob@us.com".into()],
            cc: vec![],
            subject: "Re: Intro".into(),
            body: "Sounds good".into(),
            thread_id: None,
            rfc_message_id: Some("<r1>".into()),
            references: Some("<m1> <m2>".into()),
            provider_message_id: Some("g-1".into()),
        },
    );
    out.db.insert_message(&answered).await.unwrap();

    let id = out.draft(Some(answered.id)).await;
    out.scheduler
        .schedule_send(id, Duration::ZERO, vec![])
        .await
        .unwrap();
    out.wait_until_sent(id).await;

    let emails = out.transports.gmail.sent();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].thread_id.as_deref(), Some("t-9"));
    assert_eq!(emails[0].headers.in_reply_to.as_deref(), Some("<r1>"));
    assert_eq!(emails[0].headers.references.as_deref(), Some("<m1> <m2> <r1>"));
}

#[tokio::test]
async fn microsoft_credential_uses_graph_without_thread() {
    let out = start(&["outlook"]).await;
    let id = out.draft(None).await;
    out.scheduler
        .schedule_send(id, Duration::ZERO, vec![])
        .await
        .unwrap();

    out.wait_until_sent(id).await;
    let emails = out.transports.graph.sent();
    assert_eq!(emails.len(), 1);
    assert!(emails[0].thread_id.is_none());
    assert!(emails[0].headers.references.is_none());
    assert!(out.transports.gmail.sent().is_empty());
}

#[tokio::test]
async fn no_credentials_fall_back_to_relay() {
    let out = start(&[]).await;
    let id = out.draft(None).await;
    out.scheduler
        .schedule_send(id, Duration::from_millis(50), vec![])
        .await
        .unwrap();

    // Not due yet.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(out.transports.relay.sent().is_empty());

    out.wait_until_sent(id).await;
    assert_eq!(out.transports.relay.sent().len(), 1);
    assert!(out.transports.gmail.sent().is_empty());
    assert!(out.transports.graph.sent().is_empty());
}

#[tokio::test]
async fn cancelled_send_never_reaches_a_transport() {
    let out = start(&[]).await;
    let id = out.draft(None).await;
    out.scheduler
        .schedule_send(id, Duration::from_millis(200), vec![])
        .await
        .unwrap();
    assert!(out.scheduler.cancel_scheduled_send(id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(out.transports.relay.sent().is_empty());
    let message = out.db.get_message(id).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Draft);
    assert!(message.scheduled_at.is_none());
}
