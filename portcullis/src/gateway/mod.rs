//! Authenticated proxy to the private backend.
//!
//! The browser never holds backend credentials. Each proxied request gets a client-credentials
//! token from [`token_cache::TokenCache`] and is forwarded with `Authorization: Bearer`. The
//! backend's status code and JSON body are handed back unchanged, errors included.

pub mod token_cache;

use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::{config::GatewayConfig, errors::Error};
use token_cache::{OAuthClientConfig, TokenCache, TokenError};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Client headers passed through to the backend
const FORWARDED_HEADERS: [HeaderName; 3] = [
    header::ACCEPT,
    header::ACCEPT_LANGUAGE,
    HeaderName::from_static("x-request-id"),
];

/// Shared HTTP client for the token endpoint and the backend.
pub fn build_http_client() -> Result<reqwest::Client, Error> {
    // Already installed when running under main; tests rely on this call
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .map_err(|e| Error::Configuration {
            message: format!("failed to build HTTP client: {e}"),
        })
}

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path below the backend base URL, without a leading slash
    pub path: String,
    pub query: Option<String>,
    pub body: Option<Value>,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("path traversal rejected: {path}")]
    PathTraversal { path: String },

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("backend request failed: {0}")]
    Upstream(String),
}

impl From<GatewayError> for Error {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::PathTraversal { path } => Error::PathTraversal { path },
            other => Error::UpstreamUnavailable { message: other.to_string() },
        }
    }
}

/// True if the path could climb out of the backend base path, in any spelling.
pub fn is_traversal(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    lowered.contains("..") || lowered.contains("%2e")
}

pub struct GatewayProxy {
    http: reqwest::Client,
    base_url: Url,
    oauth: OAuthClientConfig,
    tokens: Arc<TokenCache>,
}

impl GatewayProxy {
    pub fn new(http: reqwest::Client, base_url: Url, oauth: OAuthClientConfig) -> Self {
        let tokens = Arc::new(TokenCache::new(http.clone()));
        Self {
            http,
            base_url,
            oauth,
            tokens,
        }
    }

    /// `None` when no backend is configured.
    pub fn from_config(config: &GatewayConfig) -> Result<Option<Self>, Error> {
        let Some(oauth) = config.oauth.resolve()? else {
            return Ok(None);
        };
        let base_url = config.base_url.clone().ok_or_else(|| Error::Configuration {
            message: "gateway.oauth is configured but gateway.base_url is not".to_string(),
        })?;
        Ok(Some(Self::new(build_http_client()?, base_url, oauth)))
    }

    fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Forward `request` to the backend with a bearer token.
    ///
    /// Any status the backend answers with is returned as-is. Only failing to obtain a token,
    /// failing to reach the backend, or an unreadable body are errors.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path), err)]
    pub async fn proxy_request(&self, request: ProxyRequest) -> Result<ProxyResponse, GatewayError> {
        if is_traversal(&request.path) {
            warn!("Rejected traversal attempt");
            return Err(GatewayError::PathTraversal { path: request.path });
        }

        let token = self.tokens.get_access_token(&self.oauth).await?;
        let url = self.target_url(&request.path, request.query.as_deref());

        let mut upstream = self
            .http
            .request(request.method, url)
            .bearer_auth(token)
            .header(header::CONTENT_TYPE, "application/json");
        for name in FORWARDED_HEADERS {
            if let Some(value) = request.headers.get(&name) {
                upstream = upstream.header(name, value.clone());
            }
        }
        if let Some(body) = &request.body {
            upstream = upstream.json(body);
        }

        let response = upstream
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        let data = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).map_err(|e| GatewayError::Upstream(format!("backend returned invalid JSON: {e}")))?
        };

        debug!(status = status.as_u16(), "Backend responded");
        Ok(ProxyResponse { status, data })
    }
}
