use crate::{
    api::models::{auth::CsrfTokenResponse, response::ApiResponse},
    auth::csrf::{create_token, ensure_secret},
    session::Session,
};

/// Get a CSRF token for the current session
///
/// The same kind of token is also returned in the CSRF response header on every safe request.
#[utoipa::path(
    get,
    path = "/api/csrf-token",
    tag = "csrf",
    responses(
        (status = 200, description = "A token valid for this session", body = ApiResponse<CsrfTokenResponse>),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_token(session: Session) -> ApiResponse<CsrfTokenResponse> {
    let secret = ensure_secret(&session);
    ApiResponse::ok(CsrfTokenResponse {
        token: create_token(&secret),
    })
}
