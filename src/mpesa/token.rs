//! OAuth access token cache for the Safaricom API.
//!
//! Concurrent callers share one cached bearer token. When it is missing or
//! inside the refresh margin, exactly one caller performs the network refresh
//! while the rest wait on the write lock and then read the refreshed value.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

const TOKEN_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_EXPIRES_IN_SECS: u64 = 3599;
/// Tokens are refreshed this long before the authority says they expire.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("received empty access token")]
    EmptyToken,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        !self.value.is_empty() && Instant::now() < self.refresh_at
    }
}

pub struct AccessTokenCache {
    client: Client,
    auth_url: String,
    consumer_key: String,
    consumer_secret: String,
    refresh_margin: Duration,
    cached: RwLock<Option<CachedToken>>,
}

impl AccessTokenCache {
    pub fn new(
        auth_url: String,
        consumer_key: String,
        consumer_secret: String,
    ) -> Result<Self, reqwest::Error> {
        let client = crate::utils::secure_client(TOKEN_TIMEOUT)?;
        Ok(Self {
            client,
            auth_url,
            consumer_key,
            consumer_secret,
            refresh_margin: REFRESH_MARGIN,
            cached: RwLock::new(None),
        })
    }

    /// Overrides the refresh margin. Mostly useful to force refreshes in tests.
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Returns a valid bearer token, refreshing it first if needed.
    pub async fn get_token(&self) -> Result<String, TokenError> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
                return Ok(token.value.clone());
            }
        }

        let mut cached = self.cached.write().await;

        // Another caller may have refreshed while we waited for the write lock.
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }

        let token = self.fetch_token().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn fetch_token(&self) -> Result<CachedToken, TokenError> {
        tracing::debug!("Refreshing Safaricom access token");

        let response = self
            .client
            .get(&self.auth_url)
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Access token request rejected");
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        if token.access_token.is_empty() {
            return Err(TokenError::EmptyToken);
        }

        let lifetime = Duration::from_secs(parse_expires_in(token.expires_in.as_deref()));
        Ok(CachedToken {
            value: token.access_token,
            refresh_at: Instant::now() + lifetime.saturating_sub(self.refresh_margin),
        })
    }
}

/// Safaricom reports the lifetime in seconds as a string, e.g. `"3599"`.
fn parse_expires_in(raw: Option<&str>) -> u64 {
    raw.and_then(|value| value.trim().parse().ok())
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
}
