//! HTTP surface: push webhook, send scheduling, queue inspection.

pub mod sends;
pub mod webhook;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::Scheduler;
use crate::ingest::NotificationIngestor;
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub ingestor: Arc<NotificationIngestor>,
    pub scheduler: Arc<Scheduler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/gmail", post(webhook::gmail_push))
        .route("/api/messages/{id}/send", post(sends::send_message))
        .route("/api/messages/{id}/schedule", delete(sends::cancel_schedule))
        .route(
            "/api/users/{user_id}/investors/{investor_id}/draft",
            put(sends::save_draft),
        )
        .route("/api/queue", get(sends::list_queue))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "fundmail"
    }))
}

pub(crate) fn error_body(status: StatusCode, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}
