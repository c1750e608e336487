//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Read `key`, parse it, fall back to `default` when unset.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Right-hand side of generated Message-IDs.
    pub message_id_domain: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/fundmail.db"),
            message_id_domain: "fundmail.local".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            port: env_or("FUNDMAIL_PORT", defaults.port)?,
            db_path: env_opt("FUNDMAIL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            message_id_domain: env_opt("FUNDMAIL_MESSAGE_ID_DOMAIN")
                .unwrap_or(defaults.message_id_domain),
        })
    }
}

/// Generic SMTP relay used when a user has no connected mailbox.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// From address for relayed mail; the relay cannot send as the user.
    pub from_address: String,
}

impl RelayConfig {
    /// `None` if `FUNDMAIL_SMTP_HOST` is not set (relay disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(host) = env_opt("FUNDMAIL_SMTP_HOST") else {
            return Ok(None);
        };
        let username = env_opt("FUNDMAIL_SMTP_USERNAME").unwrap_or_default();
        Ok(Some(Self {
            host,
            port: env_or("FUNDMAIL_SMTP_PORT", 587)?,
            password: SecretString::from(env_opt("FUNDMAIL_SMTP_PASSWORD").unwrap_or_default()),
            from_address: env_opt("FUNDMAIL_SMTP_FROM").unwrap_or_else(|| username.clone()),
            username,
        }))
    }
}

/// Gmail API settings.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub api_base: String,
    /// Pub/Sub topic passed to `users.watch` on resubscription.
    pub pubsub_topic: Option<String>,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            api_base: "https://gmail.googleapis.com/gmail/v1".to_string(),
            pubsub_topic: None,
        }
    }
}

impl GmailConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base: env_opt("FUNDMAIL_GMAIL_API_BASE").unwrap_or(defaults.api_base),
            pubsub_topic: env_opt("FUNDMAIL_GMAIL_PUBSUB_TOPIC"),
        }
    }
}

/// Microsoft Graph settings.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub api_base: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            api_base: "https://graph.microsoft.com/v1.0".to_string(),
        }
    }
}

impl GraphConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: env_opt("FUNDMAIL_GRAPH_API_BASE").unwrap_or_else(|| Self::default().api_base),
        }
    }
}

/// OAuth token broker holding users' third-party mailbox tokens.
#[derive(Debug, Clone)]
pub struct TokenBrokerConfig {
    pub base_url: String,
    pub api_key: SecretString,
}

impl TokenBrokerConfig {
    /// `None` if `FUNDMAIL_TOKEN_BROKER_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let base_url = env_opt("FUNDMAIL_TOKEN_BROKER_URL")?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: SecretString::from(env_opt("FUNDMAIL_TOKEN_BROKER_KEY").unwrap_or_default()),
        })
    }
}

/// Outbound send worker settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Concurrent send jobs.
    pub concurrency: usize,
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on a single provider send.
    pub send_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            backoff_base: Duration::from_secs(30),
            send_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let concurrency: usize = env_or("FUNDMAIL_DISPATCH_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FUNDMAIL_DISPATCH_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(Self {
            concurrency,
            max_attempts: env_or("FUNDMAIL_DISPATCH_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_base: Duration::from_secs(env_or(
                "FUNDMAIL_DISPATCH_BACKOFF_SECS",
                defaults.backoff_base.as_secs(),
            )?),
            send_timeout: Duration::from_secs(env_or(
                "FUNDMAIL_DISPATCH_TIMEOUT_SECS",
                defaults.send_timeout.as_secs(),
            )?),
            poll_interval: Duration::from_millis(env_or(
                "FUNDMAIL_DISPATCH_POLL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
        })
    }
}

/// Inbound reply ingestion settings.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// How far back the newest-inbox-message fallback looks.
    pub recent_window: Duration,
    /// Duplicate window for subject-matched replies.
    pub fallback_dedup_window: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            recent_window: Duration::from_secs(60 * 60),
            fallback_dedup_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            recent_window: Duration::from_secs(env_or(
                "FUNDMAIL_INGEST_RECENT_WINDOW_SECS",
                defaults.recent_window.as_secs(),
            )?),
            fallback_dedup_window: Duration::from_secs(env_or(
                "FUNDMAIL_INGEST_FALLBACK_DEDUP_SECS",
                defaults.fallback_dedup_window.as_secs(),
            )?),
        })
    }
}
