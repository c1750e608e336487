//! Background send worker: claims due jobs and runs them through the
//! dispatcher, at most `concurrency` at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::dispatcher::{DispatchOutcome, Dispatcher};
use super::schedule::clear_schedule;
use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::queue::{ClaimedJob, FailOutcome, JobQueue};
use crate::store::Database;

/// Spawn the dispatch loop.
///
/// Returns a `JoinHandle` and shutdown flag. In-flight sends finish on
/// shutdown; nothing new is claimed.
pub fn spawn_dispatch_worker(
    dispatcher: Arc<Dispatcher>,
    queue: Arc<dyn JobQueue>,
    db: Arc<dyn Database>,
    config: DispatchConfig,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));

    let handle = tokio::spawn(async move {
        info!(
            concurrency = config.concurrency,
            max_attempts = config.max_attempts,
            "Dispatch worker started"
        );
        let mut tick = tokio::time::interval(config.poll_interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Dispatch worker shutting down");
                return;
            }

            let free = permits.available_permits();
            if free == 0 {
                continue;
            }

            for claimed in queue.claim_due(free).await {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    return;
                };
                let dispatcher = Arc::clone(&dispatcher);
                let queue = Arc::clone(&queue);
                let db = Arc::clone(&db);
                let timeout = config.send_timeout;
                tokio::spawn(async move {
                    let _permit = permit;
                    run_job(&dispatcher, queue.as_ref(), db.as_ref(), claimed, timeout).await;
                });
            }
        }
    });

    (handle, shutdown_flag)
}

async fn run_job(
    dispatcher: &Dispatcher,
    queue: &dyn JobQueue,
    db: &dyn Database,
    claimed: ClaimedJob,
    timeout: Duration,
) {
    let id = claimed.id;
    let outcome = match tokio::time::timeout(timeout, dispatcher.dispatch(&claimed.job)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            dispatcher.mark_failed(id).await;
            DispatchOutcome::Failed(DispatchError::Timeout { id, timeout })
        }
    };

    match outcome {
        DispatchOutcome::Sent { .. } => {
            if let Err(e) = queue.complete(id).await {
                warn!(message_id = %id, error = %e, "Could not complete job");
            }
            clear_schedule(db, id).await;
        }
        DispatchOutcome::Failed(e) => {
            match queue.fail(id, &e.to_string(), e.is_retryable()).await {
                Ok(FailOutcome::Retrying { attempt, delay }) => {
                    warn!(
                        message_id = %id,
                        attempt,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "Send failed, retry scheduled"
                    );
                }
                Ok(FailOutcome::Abandoned { attempts }) => {
                    error!(message_id = %id, attempts, error = %e, "Send abandoned");
                    clear_schedule(db, id).await;
                }
                Err(qe) => warn!(message_id = %id, error = %qe, "Could not record job failure"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use secrecy::SecretString;

    use super::*;
    use crate::dispatch::Scheduler;
    use crate::error::TransportError;
    use crate::messages::{DraftFields, MessageStatus};
    use crate::oauth::NoTokens;
    use crate::queue::{InMemoryQueue, JobState, RetryPolicy};
    use crate::store::LibSqlBackend;
    use crate::transport::{
        MailTransport, OutgoingEmail, SendReceipt, TransportFactory, TransportKind,
    };

    /// Relay that fails or hangs on demand.
    enum Behaviour {
        Succeed,
        Unavailable,
        Hang,
    }

    struct Relay(Behaviour);

    #[async_trait]
    impl MailTransport for Relay {
        fn kind(&self) -> TransportKind {
            TransportKind::Relay
        }

        async fn send(&self, _email: &OutgoingEmail) -> Result<SendReceipt, TransportError> {
            match self.0 {
                Behaviour::Succeed => Ok(SendReceipt {
                    thread_id: None,
                    provider_message_id: None,
                }),
                Behaviour::Unavailable => Err(TransportError::Unavailable {
                    provider: "relay".into(),
                    reason: "down".into(),
                }),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }
    }

    struct RelayOnly(Arc<Relay>);

    impl TransportFactory for RelayOnly {
        fn gmail(&self, _token: SecretString) -> Arc<dyn MailTransport> {
            self.0.clone()
        }
        fn graph(&self, _token: SecretString) -> Arc<dyn MailTransport> {
            self.0.clone()
        }
        fn relay(&self) -> Option<Arc<dyn MailTransport>> {
            Some(self.0.clone())
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            concurrency: 2,
            max_attempts: 2,
            backoff_base: Duration::from_millis(20),
            send_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        }
    }

    async fn run(behaviour: Behaviour) -> (Arc<LibSqlBackend>, Arc<InMemoryQueue>, uuid::Uuid) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(InMemoryQueue::new(RetryPolicy::from_config(&config())));
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            Arc::new(NoTokens),
            Arc::new(RelayOnly(Arc::new(Relay(behaviour)))),
            "fundmail.test",
        ));

        let id = db
            .save_draft(
                "u1",
                "inv1",
                DraftFields {
                    to: vec!["alice@corp.com".into()],
                    subject: "Intro".into(),
                    from_address: "bob@us.com".into(),
                    body: "<p>Hi</p>".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id;
        Scheduler::new(db.clone(), queue.clone())
            .schedule_send(id, Duration::ZERO, vec![])
            .await
            .unwrap();

        let (handle, shutdown) =
            spawn_dispatch_worker(dispatcher, queue.clone(), db.clone(), config());

        for _ in 0..200 {
            let done = queue.jobs_by_state(JobState::Completed).await.len()
                + queue.jobs_by_state(JobState::Failed).await.len();
            if done > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.store(true, Ordering::Relaxed);
        handle.abort();
        (db, queue, id)
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let (db, queue, id) = run(Behaviour::Succeed).await;
        assert_eq!(queue.jobs_by_state(JobState::Completed).await.len(), 1);
        let stored = db.get_message(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert!(stored.scheduled_at.is_none());
    }

    #[tokio::test]
    async fn retryable_failure_is_abandoned_after_max_attempts() {
        let (db, queue, id) = run(Behaviour::Unavailable).await;
        let failed = queue.jobs_by_state(JobState::Failed).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 2);
        assert_eq!(
            db.get_message(id).await.unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }

    #[tokio::test]
    async fn hung_send_times_out_as_failed() {
        let (db, queue, id) = run(Behaviour::Hang).await;
        let failed = queue.jobs_by_state(JobState::Failed).await;
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.as_deref().unwrap().contains("timed out"));
        assert_eq!(
            db.get_message(id).await.unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }
}
