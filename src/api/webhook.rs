//! Gmail Pub/Sub push endpoint.
//!
//! Every handled notification is acknowledged with 200, whatever the match
//! outcome; a non-2xx makes Pub/Sub redeliver. Only store failures answer
//! 500, with no detail.

use axum::{Json, body::Bytes, extract::State, http::StatusCode, response::IntoResponse};
use tracing::{debug, error};

use super::{AppState, error_body};

pub async fn gmail_push(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    match state.ingestor.handle_notification(&body).await {
        Ok(result) => {
            debug!(
                created = result.created(),
                outcomes = ?result.outcomes,
                "Push notification handled"
            );
            (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
        }
        Err(e) => {
            error!(error = %e, "Push notification failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}
