//! Error types for fundmail.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail provider transport errors.
///
/// `AuthScope` is kept apart from everything else: inbound handling treats it
/// as "resubscribe and retry once", not as a failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Provider {provider} rejected the token scope: {reason}")]
    AuthScope { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Provider {provider} rejected request ({status}): {reason}")]
    Rejected {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid outgoing message: {0}")]
    InvalidMessage(String),

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

impl TransportError {
    /// Whether the queue should try the send again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Unavailable { .. }
                | Self::Timeout { .. }
                | Self::Http(_)
        )
    }

    pub fn is_auth_scope(&self) -> bool {
        matches!(self, Self::AuthScope { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// OAuth token retrieval errors.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("No {provider} token for user {user_id}")]
    Unavailable { provider: String, user_id: String },

    #[error("Token for {provider} expired")]
    Expired { provider: String },

    #[error("Token broker request failed: {0}")]
    Http(String),
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {id} is already queued")]
    DuplicateJob { id: Uuid },

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is not active")]
    NotActive { id: Uuid },
}

/// Outbound dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Message {id} not found")]
    MessageNotFound { id: Uuid },

    #[error("Message {id} is {status} and cannot be sent")]
    NotSendable { id: Uuid, status: String },

    #[error("Invalid address {0}")]
    InvalidAddress(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Dispatch of {id} timed out after {timeout:?}")]
    Timeout { id: Uuid, timeout: Duration },

    #[error("No transport available for user {user_id}")]
    NoTransport { user_id: String },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl DispatchError {
    /// Whether the job runner should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Database(_) | Self::Timeout { .. } => true,
            Self::MessageNotFound { .. }
            | Self::NotSendable { .. }
            | Self::InvalidAddress(_)
            | Self::NoTransport { .. }
            | Self::Queue(_) => false,
        }
    }
}

/// Inbound notification errors that escape to the HTTP handler.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_scope_is_not_retryable() {
        let e = TransportError::AuthScope {
            provider: "gmail".into(),
            reason: "insufficient scope".into(),
        };
        assert!(e.is_auth_scope());
        assert!(!e.is_retryable());
    }

    #[test]
    fn rate_limit_is_retryable_through_dispatch() {
        let e = DispatchError::from(TransportError::RateLimited {
            provider: "graph".into(),
            retry_after: None,
        });
        assert!(e.is_retryable());
    }

    #[test]
    fn missing_message_is_terminal() {
        let e = DispatchError::MessageNotFound { id: Uuid::new_v4() };
        assert!(!e.is_retryable());
    }
}
