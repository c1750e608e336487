//! Draft, send-scheduling, and queue endpoints.

use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use super::{AppState, error_body};
use crate::error::{DatabaseError, DispatchError, QueueError};
use crate::mail::extract_address;
use crate::messages::DraftFields;
use crate::queue::JobState;
use crate::transport::JobAttachment;

#[derive(Debug, Default, Deserialize)]
pub struct SendRequest {
    /// Seconds from now; immediate when absent.
    #[serde(default)]
    pub delay_secs: Option<u64>,
    #[serde(default)]
    pub attachments: Vec<JobAttachment>,
}

#[derive(Debug, Deserialize)]
pub struct QueueParams {
    #[serde(default)]
    pub state: Option<String>,
}

fn parse_id(id: &str) -> Result<Uuid, (StatusCode, Json<serde_json::Value>)> {
    Uuid::parse_str(id).map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid message ID"))
}

fn dispatch_error_response(e: &DispatchError) -> (StatusCode, Json<serde_json::Value>) {
    match e {
        DispatchError::MessageNotFound { .. } => {
            error_body(StatusCode::NOT_FOUND, "Message not found")
        }
        DispatchError::NotSendable { status, .. } => error_body(
            StatusCode::CONFLICT,
            &format!("Message is {status} and cannot be sent"),
        ),
        DispatchError::Queue(QueueError::DuplicateJob { .. }) => {
            error_body(StatusCode::CONFLICT, "Message is already being sent")
        }
        other => {
            warn!(error = %other, "Scheduling failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SendRequest>,
) -> impl IntoResponse {
    let message_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let delay = Duration::from_secs(req.delay_secs.unwrap_or(0));

    match state
        .scheduler
        .schedule_send(message_id, delay, req.attachments)
        .await
    {
        Ok(run_at) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "message_id": message_id,
                "run_at": run_at,
            })),
        ),
        Err(e) => dispatch_error_response(&e),
    }
}

pub async fn cancel_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let message_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.scheduler.cancel_scheduled_send(message_id).await {
        Ok(cancelled) => (
            StatusCode::OK,
            Json(serde_json::json!({ "cancelled": cancelled })),
        ),
        Err(e) => dispatch_error_response(&e),
    }
}

pub async fn list_queue(
    State(state): State<AppState>,
    Query(params): Query<QueueParams>,
) -> impl IntoResponse {
    let job_state = match params.state.as_deref().map(str::parse::<JobState>) {
        None => JobState::Delayed,
        Some(Ok(s)) => s,
        Some(Err(e)) => return error_body(StatusCode::BAD_REQUEST, &e),
    };
    let jobs = state.scheduler.queue().jobs_by_state(job_state).await;
    (StatusCode::OK, Json(serde_json::json!(jobs)))
}

/// Reduce `"Name" <addr>` entries to bare addresses. Blank `cc` entries are
/// dropped.
fn normalize_draft(mut fields: DraftFields) -> Result<DraftFields, String> {
    let bare = |value: &str| {
        extract_address(value).ok_or_else(|| format!("Invalid address: {value}"))
    };
    fields.to = fields.to.iter().map(|a| bare(a.as_str())).collect::<Result<_, _>>()?;
    fields.cc = fields
        .cc
        .iter()
        .filter(|a| !a.trim().is_empty())
        .map(|a| bare(a.as_str()))
        .collect::<Result<_, _>>()?;
    if !fields.from_address.trim().is_empty() {
        fields.from_address = bare(fields.from_address.as_str())?;
    }
    Ok(fields)
}

pub async fn save_draft(
    State(state): State<AppState>,
    Path((user_id, investor_id)): Path<(String, String)>,
    Json(fields): Json<DraftFields>,
) -> impl IntoResponse {
    let fields = match normalize_draft(fields) {
        Ok(f) => f,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, &e),
    };
    match state.db.save_draft(&user_id, &investor_id, fields).await {
        Ok(draft) => (StatusCode::OK, Json(serde_json::json!(draft))),
        Err(DatabaseError::Constraint(_)) => {
            error_body(StatusCode::CONFLICT, "Draft was modified concurrently")
        }
        Err(e) => {
            warn!(error = %e, "Saving draft failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}
