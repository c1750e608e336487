//! Scheduling sends onto the job queue and keeping `scheduled_at` in step.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::queue::{JobQueue, RemovalReason, ScheduledSendJob};
use crate::store::Database;
use crate::transport::JobAttachment;

pub struct Scheduler {
    db: Arc<dyn Database>,
    queue: Arc<dyn JobQueue>,
}

impl Scheduler {
    pub fn new(db: Arc<dyn Database>, queue: Arc<dyn JobQueue>) -> Self {
        Self { db, queue }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Queue a DRAFT (or FAILED, for a manual resend) message to go out
    /// after `delay`. An existing pending job for the message is replaced.
    pub async fn schedule_send(
        &self,
        message_id: Uuid,
        delay: Duration,
        attachments: Vec<JobAttachment>,
    ) -> Result<DateTime<Utc>, DispatchError> {
        let message = self
            .db
            .get_message(message_id)
            .await?
            .ok_or(DispatchError::MessageNotFound { id: message_id })?;
        if !message.status.is_sendable() {
            return Err(DispatchError::NotSendable {
                id: message_id,
                status: message.status.to_string(),
            });
        }

        let mut job = ScheduledSendJob::from_message(&message);
        job.attachments = attachments;

        if self.queue.cancel(message_id).await? {
            debug!(message_id = %message_id, "Replacing pending send");
        }
        self.queue.enqueue(message_id, job, delay).await?;

        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.db.set_scheduled_at(message_id, Some(run_at)).await?;

        info!(message_id = %message_id, run_at = %run_at, "Send scheduled");
        Ok(run_at)
    }

    /// Drop a pending send. `false` if none was pending (already claimed,
    /// finished, or never scheduled).
    pub async fn cancel_scheduled_send(&self, message_id: Uuid) -> Result<bool, DispatchError> {
        let cancelled = self.queue.cancel(message_id).await?;
        if cancelled {
            self.db.set_scheduled_at(message_id, None).await?;
            info!(message_id = %message_id, "Scheduled send cancelled");
        }
        Ok(cancelled)
    }
}

/// Clear `scheduled_at`, logging store errors.
pub(crate) async fn clear_schedule(db: &dyn Database, message_id: Uuid) {
    if let Err(e) = db.set_scheduled_at(message_id, None).await {
        warn!(message_id = %message_id, error = %e, "Failed to clear scheduled_at");
    }
}

/// Revert `scheduled_at` when a job is deleted from the queue behind the
/// scheduler's back.
pub fn spawn_removal_listener(queue: Arc<dyn JobQueue>, db: Arc<dyn Database>) -> JoinHandle<()> {
    let mut removals = queue.subscribe_removals();
    tokio::spawn(async move {
        loop {
            match removals.recv().await {
                Ok(event) => {
                    // Cancellations are handled by whoever cancelled.
                    if event.reason != RemovalReason::Deleted {
                        continue;
                    }
                    if queue.is_queued(event.job_id).await {
                        continue;
                    }
                    info!(message_id = %event.job_id, "Scheduled job removed, clearing schedule");
                    clear_schedule(db.as_ref(), event.job_id).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Removal listener lagged");
                }
                Err(RecvError::Closed) => {
                    debug!("Removal channel closed");
                    return;
                }
            }
        }
    })
}
