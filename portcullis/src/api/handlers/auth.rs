use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::collections::HashMap;

use crate::{
    AppState,
    api::models::{
        auth::{AuthStatus, LogoutResponse},
        response::{ApiResponse, ErrorResponse},
    },
    audit::{AuditEvent, RequestMeta},
    auth::{current_user::CurrentUser, drivers::AuthContext, principal::Principal},
    errors::Error,
    session::Session,
};

fn redirect(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Start the login ceremony with the configured driver
#[utoipa::path(
    get,
    path = "/api/auth/login",
    tag = "authentication",
    params(("user" = Option<usize>, Query, description = "Mock driver only: index of the identity to log in as")),
    responses(
        (status = 302, description = "Redirect to the identity provider (or straight to the callback for the mock driver)"),
        (status = 500, description = "Driver misconfigured", body = ErrorResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn login(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Result<Response, Error> {
    let url = state.auth.login(&AuthContext::from_query(query))?;
    Ok(redirect(&url))
}

/// Complete the login ceremony
///
/// Accepts the identity provider's answer either as a query string (GET) or as a form post.
/// Always redirects back to the frontend; failures carry `?error=<code>`.
#[utoipa::path(
    post,
    path = "/api/auth/callback",
    tag = "authentication",
    request_body(content = String, content_type = "application/x-www-form-urlencoded", description = "`SAMLResponse` and `RelayState` form fields"),
    responses(
        (status = 302, description = "Redirect to the frontend, with `/login?error=<code>` on failure"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn callback(
    State(state): State<AppState>,
    meta: RequestMeta,
    session: Session,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let form: HashMap<String, String> = if body.is_empty() {
        HashMap::new()
    } else {
        serde_urlencoded::from_bytes(&body).unwrap_or_default()
    };
    let ctx = AuthContext { query, form };
    let frontend = state.config.frontend_url.as_str().trim_end_matches('/');

    match state.auth.callback(&ctx, &session).await {
        Ok(principal) => {
            state.audit.security_event(
                AuditEvent::new("login_success", Some(&principal.id), &meta).with_details(json!({ "driver": state.auth.driver_name() })),
            );
            redirect(state.config.frontend_url.as_str())
        }
        Err(e) => {
            tracing::warn!(error = %e, "Login callback failed");
            state.audit.security_event(
                AuditEvent::new("login_failed", None, &meta).with_details(json!({
                    "driver": state.auth.driver_name(),
                    "reason": e.to_string(),
                })),
            );
            redirect(&format!("{frontend}/login?error={}", e.code().to_lowercase()))
        }
    }
}

/// End the session
#[utoipa::path(
    post,
    path = "/api/auth/logout",
    tag = "authentication",
    responses(
        (status = 200, description = "Session destroyed", body = ApiResponse<LogoutResponse>),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
        (status = 403, description = "CSRF token missing or invalid", body = ErrorResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(
    State(state): State<AppState>,
    meta: RequestMeta,
    session: Session,
    CurrentUser(user): CurrentUser,
) -> Result<ApiResponse<LogoutResponse>, Error> {
    let redirect_url = state.auth.logout(&session).await?;
    state
        .audit
        .security_event(AuditEvent::new("logout", Some(&user.id), &meta));
    Ok(ApiResponse::ok(LogoutResponse { redirect_url }))
}

/// Get the authenticated principal
#[utoipa::path(
    get,
    path = "/api/auth/me",
    tag = "authentication",
    responses(
        (status = 200, description = "Current principal", body = ApiResponse<Principal>),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn me(CurrentUser(user): CurrentUser) -> ApiResponse<Principal> {
    ApiResponse::ok(user)
}

/// Report whether the caller is logged in, without failing when they are not
#[utoipa::path(
    get,
    path = "/api/auth/status",
    tag = "authentication",
    responses(
        (status = 200, description = "Authentication status", body = ApiResponse<AuthStatus>),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn status(State(state): State<AppState>, user: Option<CurrentUser>) -> ApiResponse<AuthStatus> {
    ApiResponse::ok(AuthStatus {
        authenticated: user.is_some(),
        driver: state.auth.driver_name().to_string(),
    })
}
