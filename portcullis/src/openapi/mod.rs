//! OpenAPI document for the `/api` surface, served at `/api/openapi.json`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::{
    api::{
        self,
        models::{
            auth::{AuthStatus, CsrfTokenResponse, LogoutResponse},
            health::{HealthResponse, InfoResponse},
            response::{ErrorBody, ErrorResponse},
        },
    },
    auth::principal::Principal,
};

/// Session cookie and CSRF header schemes.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "SessionCookie".to_string(),
                SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::with_description(
                    "portcullis.sid",
                    "Signed session cookie issued by the login callback",
                ))),
            );
            components.security_schemes.insert(
                "CsrfToken".to_string(),
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "x-csrf-token",
                    "Required on POST, PUT, PATCH and DELETE. Obtain it from `/api/csrf-token` or from \
                     the same header on any GET response.",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Portcullis",
        description = "Backend-for-frontend: session authentication, CSRF protection and an authenticated data gateway.",
    ),
    paths(
        api::handlers::health::health,
        api::handlers::health::info,
        api::handlers::auth::login,
        api::handlers::auth::callback,
        api::handlers::auth::logout,
        api::handlers::auth::me,
        api::handlers::auth::status,
        api::handlers::csrf::get_token,
        api::handlers::data::proxy,
    ),
    components(schemas(
        Principal,
        AuthStatus,
        LogoutResponse,
        CsrfTokenResponse,
        HealthResponse,
        InfoResponse,
        ErrorBody,
        ErrorResponse,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "system", description = "Health and service information"),
        (name = "authentication", description = "Login ceremony and session"),
        (name = "csrf", description = "CSRF token issuance"),
        (name = "data", description = "Authenticated proxy to the private backend"),
    )
)]
pub struct ApiDoc;
