//! OAuth2 client-credentials tokens for the private backend.
//!
//! One token is cached per process. It is reused until 60 seconds before it expires. While a
//! fetch is running, every caller awaits that same fetch instead of starting its own, so a burst
//! of requests after expiry costs one round trip to the token endpoint.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// A cached token is treated as expired this long before its real expiry
pub const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// Lifetime assumed when the token endpoint does not report one
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Complete client-credentials settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub token_endpoint: Url,
}

impl std::fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .field("token_endpoint", &self.token_endpoint)
            .finish()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    #[error("token endpoint returned an unusable response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    /// Epoch milliseconds
    expires_at: i64,
}

impl CachedToken {
    fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at - TOKEN_EXPIRY_BUFFER.as_millis() as i64
    }
}

type TokenFuture = Shared<BoxFuture<'static, Result<String, TokenError>>>;

#[derive(Default)]
struct CacheState {
    cached: Option<CachedToken>,
    in_flight: Option<TokenFuture>,
    /// Bumped by every clear so a fetch started before it cannot repopulate the cache
    generation: u64,
}

pub struct TokenCache {
    http: reqwest::Client,
    state: Arc<Mutex<CacheState>>,
}

impl TokenCache {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
        state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a valid access token, fetching one if the cache cannot serve it.
    #[instrument(skip_all, fields(client_id = %config.client_id))]
    pub async fn get_access_token(&self, config: &OAuthClientConfig) -> Result<String, TokenError> {
        let fetch = {
            let mut state = Self::lock(&self.state);

            if let Some(token) = &state.cached
                && token.is_fresh(Utc::now().timestamp_millis())
            {
                debug!("Using cached access token");
                return Ok(token.access_token.clone());
            }

            match &state.in_flight {
                Some(fetch) => {
                    debug!("Joining in-flight token request");
                    fetch.clone()
                }
                None => {
                    // Runs on its own task so the fetch completes even if every waiter goes away
                    let task = tokio::spawn(fetch_and_cache(
                        self.http.clone(),
                        config.clone(),
                        self.state.clone(),
                        state.generation,
                    ));
                    let fetch = async move {
                        task.await
                            .unwrap_or_else(|e| Err(TokenError::Transport(format!("token request task failed: {e}"))))
                    }
                    .boxed()
                    .shared();
                    state.in_flight = Some(fetch.clone());
                    fetch
                }
            }
        };

        fetch.await
    }

    /// Forget the cached token and any fetch in progress.
    pub fn clear_token_cache(&self) {
        let mut state = Self::lock(&self.state);
        state.cached = None;
        state.in_flight = None;
        state.generation = state.generation.wrapping_add(1);
        debug!("Token cache cleared");
    }
}

async fn fetch_and_cache(
    http: reqwest::Client,
    config: OAuthClientConfig,
    state: Arc<Mutex<CacheState>>,
    generation: u64,
) -> Result<String, TokenError> {
    let result = request_token(&http, &config).await;

    let mut state = TokenCache::lock(&state);
    if state.generation == generation {
        state.in_flight = None;
        if let Ok(token) = &result {
            state.cached = Some(token.clone());
        }
    }

    result.map(|token| token.access_token)
}

async fn request_token(http: &reqwest::Client, config: &OAuthClientConfig) -> Result<CachedToken, TokenError> {
    let form = [
        ("grant_type", "client_credentials"),
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
        ("scope", config.scope.as_str()),
    ];

    let response = http
        .post(config.token_endpoint.clone())
        .form(&form)
        .send()
        .await
        .map_err(|e| TokenError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "Token request rejected");
        return Err(TokenError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| TokenError::InvalidResponse(e.to_string()))?;

    let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    info!(expires_in, "Fetched access token");

    let expires_in_ms = i64::try_from(expires_in.saturating_mul(1000)).unwrap_or(i64::MAX);
    Ok(CachedToken {
        access_token: body.access_token,
        expires_at: Utc::now().timestamp_millis().saturating_add(expires_in_ms),
    })
}
