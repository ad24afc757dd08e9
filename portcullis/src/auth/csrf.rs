//! CSRF protection for state-changing requests.
//!
//! Each session lineage owns a random secret that never leaves the server. Tokens handed to the
//! browser are `<nonce>.<hmac(secret, nonce)>`: every token is different, any of them verifies
//! against the secret, and none reveals it. Safe requests provision the secret on first sight and
//! receive a fresh token in the configured response header. Mutations must echo a token back in
//! that header or in the configured body field.

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, header},
    middleware::Next,
    response::Response,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::{
    AppState,
    audit::{AuditEvent, RequestMeta},
    auth::principal,
    crypto::{Signer, random_token},
    errors::{CsrfFailure, Error},
    session::Session,
};

/// Fresh per-session secret
pub fn generate_secret() -> String {
    random_token::<32>()
}

/// Derive a token from `secret`. Each call yields a different token.
pub fn create_token(secret: &str) -> String {
    Signer::new(secret).seal(&random_token::<16>())
}

/// Check that `token` was derived from `secret`.
pub fn verify_token(secret: &str, token: &str) -> bool {
    Signer::new(secret).unseal(token).is_some_and(|nonce| !nonce.is_empty())
}

/// Return the session's secret, provisioning one if it has none yet.
pub fn ensure_secret(session: &Session) -> String {
    match session.csrf_secret() {
        Some(secret) => secret,
        None => {
            let secret = generate_secret();
            session.set_csrf_secret(Some(secret.clone()));
            debug!("Provisioned CSRF secret");
            secret
        }
    }
}

fn token_header(name: &str, token: &str) -> Result<(HeaderName, HeaderValue), Error> {
    let name = HeaderName::try_from(name).map_err(|e| Error::Internal {
        operation: format!("encode CSRF header name: {e}"),
    })?;
    let value = HeaderValue::from_str(token).map_err(|e| Error::Internal {
        operation: format!("encode CSRF token header: {e}"),
    })?;
    Ok((name, value))
}

/// Read-only methods. These never need a CSRF token and are never treated as mutations.
pub fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Pull the token out of a buffered JSON or form body.
fn token_from_body(content_type: Option<&str>, body: &[u8], field: &str) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let content_type = content_type.unwrap_or_default();

    if content_type.starts_with("application/json") {
        let value: Value = serde_json::from_slice(body).ok()?;
        return value.get(field)?.as_str().map(str::to_string);
    }

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let form: HashMap<String, String> = serde_urlencoded::from_bytes(body).ok()?;
        return form.get(field).cloned();
    }

    None
}

/// Find the submitted token, buffering and restoring the body if the header is absent.
async fn submitted_token(state: &AppState, request: Request) -> Result<(Option<String>, Request), Error> {
    let config = &state.config.csrf;

    if let Some(token) = request
        .headers()
        .get(config.header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Ok((Some(token.to_string()), request));
    }

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, config.max_body_bytes).await.map_err(|e| Error::BadRequest {
        message: format!("Failed to read request body: {e}"),
    })?;

    let token = token_from_body(content_type.as_deref(), &bytes, &config.body_field);
    Ok((token, Request::from_parts(parts, Body::from(bytes))))
}

/// Validate the CSRF token of a request against its session.
///
/// Returns the request (body restored) when it may proceed.
#[instrument(skip_all)]
pub async fn check_csrf(state: &AppState, session: &Session, request: Request) -> Result<Request, Error> {
    let meta = RequestMeta::from_request(&request, state.config.trust_proxy);
    let (token, request) = submitted_token(state, request).await?;

    let verdict = match (token, session.csrf_secret()) {
        (None, _) => Err(CsrfFailure::Missing),
        (Some(_), None) => Err(CsrfFailure::Invalid),
        (Some(token), Some(secret)) if verify_token(&secret, &token) => Ok(()),
        (Some(_), Some(_)) => Err(CsrfFailure::Invalid),
    };

    match verdict {
        Ok(()) => Ok(request),
        Err(reason) => {
            let user = session.raw_user().as_ref().and_then(principal::decode);
            state.audit.security_event(
                AuditEvent::new("csrf_rejected", user.as_ref().map(|p| p.id.as_str()), &meta).with_details(json!({ "reason": reason })),
            );
            Err(Error::CsrfRejected { reason })
        }
    }
}

/// Gate state-changing requests and hand out tokens on safe ones.
pub async fn csrf_middleware(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, Error> {
    let path = request.uri().path();
    if state.config.csrf.exempt_paths.iter().any(|exempt| exempt == path) {
        return Ok(next.run(request).await);
    }

    let session = Session::from_extensions(request.extensions())?;

    if is_safe_method(request.method()) {
        let secret = ensure_secret(&session);
        let mut response = next.run(request).await;
        let (name, token) = token_header(&state.config.csrf.header_name, &create_token(&secret))?;
        response.headers_mut().insert(name, token);
        return Ok(response);
    }

    let request = check_csrf(&state, &session, request).await?;
    Ok(next.run(request).await)
}
