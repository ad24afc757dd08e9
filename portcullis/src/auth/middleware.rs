//! Request-time authorization gates.
//!
//! Each gate comes as a plain function that takes the request and either hands it back or fails,
//! plus a thin `axum` middleware wrapper. Gates compose by layering: `require_role` and
//! `require_recent_authentication` expect `require_authenticated` to have run first.
//!
//! Every denial is reported to the audit sink before the error response is produced.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::{
    AppState,
    audit::{AuditEvent, RequestMeta},
    auth::{csrf::is_safe_method, current_user::CurrentUser, principal},
    errors::Error,
    session::Session,
};

fn audit(state: &AppState, request: &Request, event: &str, user_id: Option<&str>, details: Value) {
    let meta = RequestMeta::from_request(request, state.config.trust_proxy);
    state
        .audit
        .security_event(AuditEvent::new(event, user_id, &meta).with_details(details));
}

/// Decode the session principal and attach it to the request.
///
/// An empty session is plain unauthenticated. A session holding data that fails validation is
/// destroyed, since it can only come from a corrupted or tampered store.
#[instrument(skip_all)]
pub async fn authenticate(state: &AppState, mut request: Request) -> Result<Request, Error> {
    let session = Session::from_extensions(request.extensions())?;

    let raw = match session.raw_user() {
        None | Some(Value::Null) => {
            audit(state, &request, "authentication_required", None, Value::Null);
            return Err(Error::Unauthenticated {
                message: Some("Authentication required".to_string()),
            });
        }
        Some(raw) => raw,
    };

    let Some(principal) = principal::decode(&raw) else {
        warn!("Session principal failed validation, destroying session");
        if let Err(e) = session.destroy().await {
            state
                .audit
                .error("Failed to destroy invalid session", json!({ "error": e.to_string() }));
        }
        audit(state, &request, "session_invalid", None, Value::Null);
        return Err(Error::SessionInvalid);
    };

    debug!(user_id = %principal.id, "Request authenticated");
    request.extensions_mut().insert(CurrentUser(principal));
    Ok(request)
}

/// Reject requests without a valid session principal.
pub async fn require_authenticated(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, Error> {
    let request = authenticate(&state, request).await?;
    Ok(next.run(request).await)
}

/// Attach the session principal when there is a valid one. Never rejects.
pub async fn optional_authenticated(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if let Ok(session) = Session::from_extensions(request.extensions())
        && let Some(principal) = state.auth.current_user(&session)
    {
        request.extensions_mut().insert(CurrentUser(principal));
    }
    next.run(request).await
}

/// Parameters of a [`require_role`] layer.
#[derive(Clone)]
pub struct RoleGate {
    pub state: AppState,
    pub roles: Arc<[String]>,
}

impl RoleGate {
    pub fn new<I, R>(state: AppState, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self {
            state,
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

/// Admit principals holding at least one of `roles`.
#[instrument(skip_all)]
pub fn authorize_roles(state: &AppState, roles: &[String], request: Request) -> Result<Request, Error> {
    let Some(CurrentUser(principal)) = request.extensions().get::<CurrentUser>() else {
        audit(state, &request, "authentication_required", None, json!({ "required_roles": roles }));
        return Err(Error::Unauthenticated { message: None });
    };

    if state.auth.has_role(principal, roles) {
        return Ok(request);
    }

    let actual = principal.roles().to_vec();
    audit(
        state,
        &request,
        "authorization_denied",
        Some(&principal.id),
        json!({ "required_roles": roles, "actual_roles": actual }),
    );
    Err(Error::InsufficientRoles {
        required: roles.to_vec(),
        actual,
    })
}

pub async fn require_role(State(gate): State<RoleGate>, request: Request, next: Next) -> Result<Response, Error> {
    let request = authorize_roles(&gate.state, &gate.roles, request)?;
    Ok(next.run(request).await)
}

/// Parameters of a [`require_recent_authentication`] layer.
#[derive(Clone)]
pub struct RecentAuthGate {
    pub state: AppState,
    pub max_age_minutes: u64,
    /// Let safe methods through without checking
    pub mutations_only: bool,
}

/// Admit requests whose session logged in within `max_age_minutes` of `now_ms`.
#[instrument(skip_all)]
pub fn check_recent_authentication(state: &AppState, max_age_minutes: u64, now_ms: i64, request: Request) -> Result<Request, Error> {
    let session = Session::from_extensions(request.extensions())?;
    let user_id = request.extensions().get::<CurrentUser>().map(|user| user.id.clone());
    let max_age_ms = i64::try_from(max_age_minutes.saturating_mul(60_000)).unwrap_or(i64::MAX);

    let age_ms = session.last_auth_at().map(|at| now_ms.saturating_sub(at));
    match age_ms {
        Some(age) if age <= max_age_ms => Ok(request),
        _ => {
            audit(
                state,
                &request,
                "reauthentication_required",
                user_id.as_deref(),
                json!({
                    "max_age_minutes": max_age_minutes,
                    "age_minutes": age_ms.map(|age| age / 60_000),
                }),
            );
            Err(Error::ReauthenticationRequired { max_age_minutes })
        }
    }
}

pub async fn require_recent_authentication(State(gate): State<RecentAuthGate>, request: Request, next: Next) -> Result<Response, Error> {
    if gate.mutations_only && is_safe_method(request.method()) {
        return Ok(next.run(request).await);
    }

    let now_ms = Utc::now().timestamp_millis();
    let request = check_recent_authentication(&gate.state, gate.max_age_minutes, now_ms, request)?;
    Ok(next.run(request).await)
}
