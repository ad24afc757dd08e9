//! Security audit trail.
//!
//! Every denial and every security-relevant decision is reported to an [`AuditSink`] before the
//! response is sent. Events carry identifiers and decision metadata only; credentials, tokens and
//! session contents never reach the sink.

use axum::{
    extract::{ConnectInfo, FromRequestParts, OriginalUri, Request},
    http::{Extensions, HeaderMap, Method, Uri, request::Parts},
};
use serde::Serialize;
use serde_json::Value;
use std::{
    net::SocketAddr,
    sync::{Mutex, PoisonError},
};

use crate::{AppState, errors::Error};

/// Subject recorded when no principal is attached to the request
pub const ANONYMOUS: &str = "anonymous";

/// Where a request came from and what it asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestMeta {
    pub ip: String,
    pub method: String,
    pub path: String,
}

impl RequestMeta {
    pub fn new(method: &Method, uri: &Uri, headers: &HeaderMap, extensions: &Extensions, trust_proxy: bool) -> Self {
        // Inside nested routers the URI is stripped of its prefix; prefer the original
        let path = extensions
            .get::<OriginalUri>()
            .map(|original| original.0.path().to_string())
            .unwrap_or_else(|| uri.path().to_string());

        Self {
            ip: client_ip(headers, extensions, trust_proxy),
            method: method.to_string(),
            path,
        }
    }

    pub fn from_request(request: &Request, trust_proxy: bool) -> Self {
        Self::new(request.method(), request.uri(), request.headers(), request.extensions(), trust_proxy)
    }

    pub fn from_parts(parts: &Parts, trust_proxy: bool) -> Self {
        Self::new(&parts.method, &parts.uri, &parts.headers, &parts.extensions, trust_proxy)
    }
}

impl FromRequestParts<AppState> for RequestMeta {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(parts, state.config.trust_proxy))
    }
}

/// Resolve the caller's address: first `X-Forwarded-For` hop when behind a trusted proxy,
/// otherwise the socket peer, otherwise `unknown`.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions, trust_proxy: bool) -> String {
    if trust_proxy
        && let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty())
    {
        return first.to_string();
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// A single security decision.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event: String,
    pub user_id: String,
    pub ip: String,
    pub method: String,
    pub path: String,
    pub details: Value,
}

impl AuditEvent {
    pub fn new(event: impl Into<String>, user_id: Option<&str>, meta: &RequestMeta) -> Self {
        Self {
            event: event.into(),
            user_id: user_id.unwrap_or(ANONYMOUS).to_string(),
            ip: meta.ip.clone(),
            method: meta.method.clone(),
            path: meta.path.clone(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Destination for audit events and audited errors.
pub trait AuditSink: Send + Sync {
    fn security_event(&self, event: AuditEvent);

    fn error(&self, message: &str, context: Value);
}

/// Writes audit records as structured `tracing` events on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn security_event(&self, event: AuditEvent) {
        tracing::warn!(
            target: "audit",
            event = %event.event,
            user_id = %event.user_id,
            ip = %event.ip,
            method = %event.method,
            path = %event.path,
            details = %event.details,
            "security event"
        );
    }

    fn error(&self, message: &str, context: Value) {
        tracing::error!(target: "audit", context = %context, "{}", message);
    }
}

/// Keeps events in memory. Used by tests and by embedders that forward events elsewhere.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    errors: Mutex<Vec<(String, Value)>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn errors(&self) -> Vec<(String, Value)> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Events with the given name, oldest first
    pub fn named(&self, event: &str) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|e| e.event == event).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn security_event(&self, event: AuditEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    fn error(&self, message: &str, context: Value) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((message.to_string(), context));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_client_ip_prefers_forwarded_header_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 5555))));

        assert_eq!(client_ip(&headers, &extensions, true), "203.0.113.9");
        assert_eq!(client_ip(&headers, &extensions, false), "10.0.0.1");
        assert_eq!(client_ip(&HeaderMap::new(), &Extensions::new(), true), "unknown");
    }

    #[test]
    fn test_event_defaults_to_anonymous_subject() {
        let meta = RequestMeta {
            ip: "127.0.0.1".to_string(),
            method: "POST".to_string(),
            path: "/api/data/items".to_string(),
        };
        let event = AuditEvent::new("csrf_rejected", None, &meta).with_details(json!({ "reason": "missing" }));

        assert_eq!(event.user_id, ANONYMOUS);
        assert_eq!(event.path, "/api/data/items");

        let sink = MemoryAuditSink::default();
        sink.security_event(event);
        assert_eq!(sink.named("csrf_rejected").len(), 1);
        assert!(sink.named("login_failed").is_empty());
    }
}
