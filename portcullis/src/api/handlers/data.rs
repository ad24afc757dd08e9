use axum::{
    Json,
    body::Bytes,
    extract::{OriginalUri, State},
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::{
    AppState,
    api::models::response::ErrorResponse,
    audit::{AuditEvent, RequestMeta},
    auth::current_user::CurrentUser,
    errors::Error,
    gateway::{GatewayError, ProxyRequest},
};

/// Prefix of the proxied routes, as seen before any router nesting
pub const DATA_PREFIX: &str = "/api/data/";

/// Proxy a request to the private backend
///
/// The path after `/api/data/` and the query string are forwarded as-is. The backend's status
/// and JSON body are returned unchanged.
#[utoipa::path(
    get,
    path = "/api/data/{path}",
    tag = "data",
    params(("path" = String, Path, description = "Backend path")),
    request_body(content = Object, description = "JSON body forwarded to the backend (mutating methods)"),
    responses(
        (status = 200, description = "Backend response, status and body passed through"),
        (status = 400, description = "Path traversal attempt", body = ErrorResponse),
        (status = 401, description = "Not authenticated or reauthentication required", body = ErrorResponse),
        (status = 403, description = "Missing role or CSRF token", body = ErrorResponse),
        (status = 502, description = "Token endpoint or backend unreachable", body = ErrorResponse),
        (status = 503, description = "No backend configured", body = ErrorResponse),
    )
)]
#[tracing::instrument(skip_all, fields(user_id = %user.id))]
pub async fn proxy(
    State(state): State<AppState>,
    meta: RequestMeta,
    user: CurrentUser,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    let Some(gateway) = state.gateway.as_ref() else {
        return Err(Error::GatewayDisabled);
    };

    let path = uri.path().strip_prefix(DATA_PREFIX).unwrap_or_default().to_string();

    let body = if body.is_empty() {
        None
    } else {
        let mut value: Value = serde_json::from_slice(&body).map_err(|e| Error::BadRequest {
            message: format!("Request body must be JSON: {e}"),
        })?;
        // The CSRF token is ours, not the backend's
        if let Value::Object(map) = &mut value {
            map.remove(&state.config.csrf.body_field);
        }
        Some(value)
    };

    let request = ProxyRequest {
        method,
        path,
        query: uri.query().map(str::to_string),
        body,
        headers,
    };

    match gateway.proxy_request(request).await {
        Ok(response) if response.data.is_null() => Ok(response.status.into_response()),
        Ok(response) => Ok((response.status, Json(response.data)).into_response()),
        Err(GatewayError::PathTraversal { path }) => {
            state.audit.security_event(
                AuditEvent::new("path_traversal", Some(&user.id), &meta).with_details(json!({ "requested_path": path })),
            );
            Err(Error::PathTraversal { path })
        }
        Err(e) => Err(e.into()),
    }
}
