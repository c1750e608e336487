//! Third-party mailbox OAuth tokens.
//!
//! Tokens live in an external broker keyed by (user, provider name). The same
//! provider is registered under several names depending on how the user
//! connected, so lookups walk an alias list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::config::TokenBrokerConfig;
use crate::error::TokenError;

/// A short-lived provider access token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: SecretString,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// Mailbox provider families that can send on a user's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    Google,
    Microsoft,
}

impl ProviderFamily {
    /// Broker names to try, in order.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Google => &["google", "google-oauth2", "gmail"],
            Self::Microsoft => &["microsoft", "windowslive", "outlook"],
        }
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn get_access_token(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<AccessToken, TokenError>;
}

/// First usable token across the family's aliases.
///
/// Errors and expired tokens count as "no credential"; callers fall through
/// to the next transport.
pub async fn resolve_token(
    source: &dyn TokenSource,
    user_id: &str,
    family: ProviderFamily,
) -> Option<AccessToken> {
    for alias in family.aliases() {
        match source.get_access_token(user_id, alias).await {
            Ok(token) if !token.is_expired() => {
                debug!(user_id, provider = alias, "Resolved access token");
                return Some(token);
            }
            Ok(_) => debug!(user_id, provider = alias, "Access token expired"),
            Err(e) => debug!(user_id, provider = alias, error = %e, "No access token"),
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct BrokerTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Token broker client: `GET {base}/users/{user}/tokens/{provider}`.
pub struct HttpTokenSource {
    http: reqwest::Client,
    config: TokenBrokerConfig,
}

impl HttpTokenSource {
    pub fn new(config: TokenBrokerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn get_access_token(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<AccessToken, TokenError> {
        let url = format!(
            "{}/users/{}/tokens/{}",
            self.config.base_url, user_id, provider
        );
        let resp = self
            .http
            .get(&url)
            .header("x-api-key", self.config.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| TokenError::Http(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TokenError::Unavailable {
                provider: provider.to_string(),
                user_id: user_id.to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(TokenError::Http(format!(
                "token broker returned {}",
                resp.status()
            )));
        }

        let body: BrokerTokenResponse = resp
            .json()
            .await
            .map_err(|e| TokenError::Http(e.to_string()))?;
        let token = AccessToken {
            token: SecretString::from(body.access_token),
            expires_at: body.expires_at,
        };
        if token.is_expired() {
            return Err(TokenError::Expired {
                provider: provider.to_string(),
            });
        }
        Ok(token)
    }
}

/// Source with no tokens at all; every user goes through the relay.
pub struct NoTokens;

#[async_trait]
impl TokenSource for NoTokens {
    async fn get_access_token(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<AccessToken, TokenError> {
        Err(TokenError::Unavailable {
            provider: provider.to_string(),
            user_id: user_id.to_string(),
        })
    }
}
