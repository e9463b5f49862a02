use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::TransportError;

/// A bearer token and the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Whether the token expires within `skew` of `now`.
    pub fn expires_within(&self, skew: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - skew <= now
    }
}

/// Credential acquisition and refresh, provided by the caller.
#[async_trait]
pub trait TokenCredential: Send + Sync + 'static {
    async fn get_token(&self) -> Result<AccessToken, TransportError>;
}

/// Hands out the same token every time. Useful against emulators.
#[derive(Debug, Clone)]
pub struct StaticTokenCredential {
    token: AccessToken,
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: AccessToken {
                token: token.into(),
                expires_at,
            },
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self) -> Result<AccessToken, TransportError> {
        Ok(self.token.clone())
    }
}
