//! In-process delayed job queue.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ClaimedJob, FailOutcome, JobQueue, JobSnapshot, JobState, RemovalEvent, RemovalReason,
    RetryPolicy, ScheduledSendJob,
};
use crate::error::QueueError;

const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Completed and failed jobs kept for inspection.
const MAX_FINISHED: usize = 500;

struct Entry {
    job: ScheduledSendJob,
    state: JobState,
    attempts: u32,
    due: Instant,
    run_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl Entry {
    fn snapshot(&self, id: Uuid) -> JobSnapshot {
        JobSnapshot {
            id,
            state: self.state,
            attempts: self.attempts,
            run_at: self.run_at,
            last_error: self.last_error.clone(),
            job: self.job.clone(),
        }
    }

    fn delay_until(&mut self, delay: Duration) {
        self.due = Instant::now() + delay;
        self.run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

#[derive(Default)]
struct Jobs {
    entries: HashMap<Uuid, Entry>,
    finished: VecDeque<Uuid>,
}

impl Jobs {
    fn finish(&mut self, id: Uuid) {
        self.finished.push_back(id);
        while self.finished.len() > MAX_FINISHED {
            let Some(old) = self.finished.pop_front() else {
                break;
            };
            if self
                .entries
                .get(&old)
                .is_some_and(|e| !e.state.is_queued())
            {
                self.entries.remove(&old);
            }
        }
    }
}

pub struct InMemoryQueue {
    jobs: RwLock<Jobs>,
    policy: RetryPolicy,
    removals: broadcast::Sender<RemovalEvent>,
}

impl InMemoryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        let (removals, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            jobs: RwLock::new(Jobs::default()),
            policy,
            removals,
        }
    }

    fn emit(&self, job_id: Uuid, reason: RemovalReason) {
        // No listener is fine.
        let _ = self.removals.send(RemovalEvent { job_id, reason });
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(
        &self,
        id: Uuid,
        job: ScheduledSendJob,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().await;
        if jobs.entries.get(&id).is_some_and(|e| e.state.is_queued()) {
            return Err(QueueError::DuplicateJob { id });
        }

        let mut entry = Entry {
            job,
            state: JobState::Delayed,
            attempts: 0,
            due: Instant::now(),
            run_at: Utc::now(),
            last_error: None,
        };
        entry.delay_until(delay);
        jobs.entries.insert(id, entry);

        info!(job_id = %id, delay_secs = delay.as_secs(), "Job enqueued");
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.write().await;
        match jobs.entries.get(&id).map(|e| e.state) {
            Some(JobState::Delayed) => {
                jobs.entries.remove(&id);
                drop(jobs);
                info!(job_id = %id, "Job cancelled");
                self.emit(id, RemovalReason::Cancelled);
                Ok(true)
            }
            Some(JobState::Active) => {
                warn!(job_id = %id, "Cannot cancel active job");
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        let removed = self.jobs.write().await.entries.remove(&id);
        if removed.is_none() {
            return Err(QueueError::NotFound { id });
        }
        info!(job_id = %id, "Job deleted");
        self.emit(id, RemovalReason::Deleted);
        Ok(())
    }

    async fn claim_due(&self, max: usize) -> Vec<ClaimedJob> {
        if max == 0 {
            return Vec::new();
        }
        let now = Instant::now();
        let mut jobs = self.jobs.write().await;

        let mut due: Vec<(Instant, Uuid)> = jobs
            .entries
            .iter()
            .filter(|(_, e)| e.state == JobState::Delayed && e.due <= now)
            .map(|(id, e)| (e.due, *id))
            .collect();
        due.sort();
        due.truncate(max);

        due.into_iter()
            .filter_map(|(_, id)| {
                let entry = jobs.entries.get_mut(&id)?;
                entry.state = JobState::Active;
                entry.attempts += 1;
                debug!(job_id = %id, attempt = entry.attempts, "Job claimed");
                Some(ClaimedJob {
                    id,
                    attempt: entry.attempts,
                    job: entry.job.clone(),
                })
            })
            .collect()
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .entries
            .get_mut(&id)
            .ok_or(QueueError::NotFound { id })?;
        if entry.state != JobState::Active {
            return Err(QueueError::NotActive { id });
        }
        entry.state = JobState::Completed;
        entry.last_error = None;
        jobs.finish(id);
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .entries
            .get_mut(&id)
            .ok_or(QueueError::NotFound { id })?;
        if entry.state != JobState::Active {
            return Err(QueueError::NotActive { id });
        }
        entry.last_error = Some(error.to_string());

        if retryable && entry.attempts < self.policy.max_attempts {
            let delay = self.policy.backoff(entry.attempts);
            entry.state = JobState::Delayed;
            entry.delay_until(delay);
            return Ok(FailOutcome::Retrying {
                attempt: entry.attempts,
                delay,
            });
        }

        entry.state = JobState::Failed;
        let attempts = entry.attempts;
        jobs.finish(id);
        Ok(FailOutcome::Abandoned { attempts })
    }

    async fn jobs_by_state(&self, state: JobState) -> Vec<JobSnapshot> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<JobSnapshot> = jobs
            .entries
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(id, e)| e.snapshot(*id))
            .collect();
        out.sort_by_key(|s| s.run_at);
        out
    }

    async fn is_queued(&self, id: Uuid) -> bool {
        self.jobs
            .read()
            .await
            .entries
            .get(&id)
            .is_some_and(|e| e.state.is_queued())
    }

    fn subscribe_removals(&self) -> broadcast::Receiver<RemovalEvent> {
        self.removals.subscribe()
    }
}
