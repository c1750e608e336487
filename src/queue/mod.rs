//! Delayed job queue for scheduled sends.
//!
//! Job id == message id, so a message has at most one queued send and a
//! pending send is cancelled by message id alone.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::QueueError;
use crate::messages::OutboundMessage;
use crate::transport::JobAttachment;

pub use memory::InMemoryQueue;

/// Payload of a scheduled send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSendJob {
    pub message_id: Uuid,
    pub user_id: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Conversation key hint, used when the message has no predecessor.
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<JobAttachment>,
}

impl ScheduledSendJob {
    pub fn from_message(message: &OutboundMessage) -> Self {
        Self {
            message_id: message.id,
            user_id: message.user_id.clone(),
            to: message.to.clone(),
            cc: message.cc.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            thread_id: message.thread_id.clone(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Delayed or active: the job still owns its id.
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Delayed | Self::Active)
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "delayed" | "waiting" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub state: JobState,
    pub attempts: u32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub job: ScheduledSendJob,
}

/// A job handed to the worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    /// 1-based attempt number.
    pub attempt: u32,
    pub job: ScheduledSendJob,
}

/// Bounded attempts with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base,
        }
    }

    /// Delay before attempt `attempt + 1`, after `attempt` failures.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1 << exp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { attempt: u32, delay: Duration },
    Abandoned { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Cancelled through the scheduling API.
    Cancelled,
    /// Deleted out from under the scheduler (admin action, cleanup).
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalEvent {
    pub job_id: Uuid,
    pub reason: RemovalReason,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job due after `delay`. Fails with `DuplicateJob` while a job
    /// with the same id is delayed or active.
    async fn enqueue(
        &self,
        id: Uuid,
        job: ScheduledSendJob,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Remove a delayed job. `false` when there was nothing to cancel;
    /// active jobs are past the point of cancellation.
    async fn cancel(&self, id: Uuid) -> Result<bool, QueueError>;

    /// Delete a job in any state.
    async fn remove(&self, id: Uuid) -> Result<(), QueueError>;

    /// Move up to `max` due jobs to active.
    async fn claim_due(&self, max: usize) -> Vec<ClaimedJob>;

    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;

    /// Record a failed attempt; re-delays the job when `retryable` and
    /// attempts remain.
    async fn fail(&self, id: Uuid, error: &str, retryable: bool)
    -> Result<FailOutcome, QueueError>;

    async fn jobs_by_state(&self, state: JobState) -> Vec<JobSnapshot>;

    /// Whether a delayed or active job holds this id.
    async fn is_queued(&self, id: Uuid) -> bool;

    fn subscribe_removals(&self) -> broadcast::Receiver<RemovalEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_secs(30),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(120));
    }

    #[test]
    fn state_parsing() {
        assert_eq!("Delayed".parse::<JobState>().unwrap(), JobState::Delayed);
        assert_eq!("failed".parse::<JobState>().unwrap(), JobState::Failed);
        assert!("paused".parse::<JobState>().is_err());
        assert!(JobState::Active.is_queued());
        assert!(!JobState::Completed.is_queued());
    }

    #[test]
    fn job_payload_defaults() {
        let job: ScheduledSendJob = serde_json::from_str(&format!(
            r#"{{"message_id":"{}","user_id":"u1","to":["a@b.com"],"subject":"Hi","body":"<p>x</p>"}}"#,
            Uuid::nil()
        ))
        .unwrap();
        assert!(job.cc.is_empty());
        assert!(job.attachments.is_empty());
        assert!(job.thread_id.is_none());
    }
}
