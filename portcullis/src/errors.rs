use crate::session::store::SessionStoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error as ThisError;
use utoipa::ToSchema;

/// Why a state-changing request was refused by the CSRF guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CsrfFailure {
    /// No token was supplied in the header or the body
    Missing,
    /// A token was supplied but does not derive from the session secret
    Invalid,
}

impl std::fmt::Display for CsrfFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CsrfFailure::Missing => f.write_str("missing"),
            CsrfFailure::Invalid => f.write_str("invalid"),
        }
    }
}

#[derive(ThisError, Debug)]
pub enum Error {
    /// Startup configuration is unusable; the process must not start
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The identity provider rejected the ceremony, or its response could not be validated
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// Authentication required but not provided
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// The principal stored in the session failed validation
    #[error("Session invalid")]
    SessionInvalid,

    /// The principal authenticated too long ago for this operation
    #[error("Reauthentication required (max age {max_age_minutes} minutes)")]
    ReauthenticationRequired { max_age_minutes: u64 },

    /// The principal holds none of the required roles
    #[error("Insufficient roles: requires one of {required:?}, has {actual:?}")]
    InsufficientRoles { required: Vec<String>, actual: Vec<String> },

    /// CSRF token missing or invalid on a state-changing request
    #[error("CSRF token {reason}")]
    CsrfRejected { reason: CsrfFailure },

    /// Invalid request data
    #[error("{message}")]
    BadRequest { message: String },

    /// Gateway path attempted to escape the backend base path
    #[error("Path traversal rejected: {path}")]
    PathTraversal { path: String },

    /// Token endpoint or private backend could not be reached or returned garbage
    #[error("Upstream unavailable: {message}")]
    UpstreamUnavailable { message: String },

    /// Gateway routes were called but no backend is configured
    #[error("Gateway is not configured")]
    GatewayDisabled,

    /// Session backend failure
    #[error(transparent)]
    SessionStore(#[from] SessionStoreError),

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::AuthenticationFailed { .. }
            | Error::Unauthenticated { .. }
            | Error::SessionInvalid
            | Error::ReauthenticationRequired { .. } => StatusCode::UNAUTHORIZED,
            Error::InsufficientRoles { .. } | Error::CsrfRejected { .. } => StatusCode::FORBIDDEN,
            Error::BadRequest { .. } | Error::PathTraversal { .. } => StatusCode::BAD_REQUEST,
            Error::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Error::GatewayDisabled => StatusCode::SERVICE_UNAVAILABLE,
            Error::Configuration { .. } | Error::SessionStore(_) | Error::Internal { .. } | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code placed in the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration { .. } => "CONFIGURATION_ERROR",
            Error::AuthenticationFailed { .. } => "AUTHENTICATION_FAILED",
            Error::Unauthenticated { .. } => "UNAUTHENTICATED",
            Error::SessionInvalid => "SESSION_INVALID",
            Error::ReauthenticationRequired { .. } => "REAUTHENTICATION_REQUIRED",
            Error::InsufficientRoles { .. } => "FORBIDDEN",
            Error::CsrfRejected {
                reason: CsrfFailure::Missing,
            } => "CSRF_TOKEN_MISSING",
            Error::CsrfRejected {
                reason: CsrfFailure::Invalid,
            } => "CSRF_TOKEN_INVALID",
            Error::BadRequest { .. } => "BAD_REQUEST",
            Error::PathTraversal { .. } => "PATH_TRAVERSAL",
            Error::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Error::GatewayDisabled => "GATEWAY_DISABLED",
            Error::SessionStore(_) => "SESSION_ERROR",
            Error::Internal { .. } | Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Configuration { .. } => "Server misconfigured".to_string(),
            Error::AuthenticationFailed { .. } => "Authentication failed".to_string(),
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::SessionInvalid => "Session invalid, please sign in again".to_string(),
            Error::ReauthenticationRequired { .. } => "Reauthentication required".to_string(),
            Error::InsufficientRoles { .. } => "Insufficient permissions".to_string(),
            Error::CsrfRejected {
                reason: CsrfFailure::Missing,
            } => "CSRF token missing".to_string(),
            Error::CsrfRejected {
                reason: CsrfFailure::Invalid,
            } => "CSRF token invalid".to_string(),
            Error::BadRequest { message } => message.clone(),
            Error::PathTraversal { .. } => "Invalid path".to_string(),
            Error::UpstreamUnavailable { .. } => "Upstream service unavailable".to_string(),
            Error::GatewayDisabled => "Data gateway is not configured".to_string(),
            Error::SessionStore(_) | Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }

    /// Extra structured context safe to hand back to the caller
    fn details(&self) -> Option<Value> {
        match self {
            Error::InsufficientRoles { required, .. } => Some(json!({ "required_roles": required })),
            Error::CsrfRejected { reason } => Some(json!({ "reason": reason })),
            Error::ReauthenticationRequired { max_age_minutes } => Some(json!({ "max_age_minutes": max_age_minutes })),
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Configuration { .. } | Error::SessionStore(_) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::UpstreamUnavailable { .. } | Error::GatewayDisabled => {
                tracing::warn!("Upstream error: {}", self);
            }
            Error::AuthenticationFailed { .. }
            | Error::Unauthenticated { .. }
            | Error::SessionInvalid
            | Error::ReauthenticationRequired { .. }
            | Error::InsufficientRoles { .. }
            | Error::CsrfRejected { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::BadRequest { .. } | Error::PathTraversal { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let mut error = json!({
            "code": self.code(),
            "message": self.user_message(),
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }

        (self.status_code(), Json(json!({ "success": false, "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(error: Error) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_csrf_rejection_envelope() {
        let (status, body) = body_json(Error::CsrfRejected {
            reason: CsrfFailure::Missing,
        })
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "CSRF_TOKEN_MISSING");
        assert_eq!(body["error"]["details"]["reason"], "missing");
    }

    #[tokio::test]
    async fn test_internal_errors_do_not_leak() {
        let (status, body) = body_json(Error::Internal {
            operation: "talk to redis at 10.0.0.3".to_string(),
        })
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "Internal server error");
        assert!(body["error"].get("details").is_none());
    }

    #[test]
    fn test_status_codes_distinguish_identity_from_permission() {
        assert_eq!(Error::SessionInvalid.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::InsufficientRoles {
                required: vec!["admin".into()],
                actual: vec![],
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::PathTraversal { path: "../etc".into() }.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::UpstreamUnavailable { message: "reset".into() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}
