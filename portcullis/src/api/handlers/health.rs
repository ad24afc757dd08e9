use axum::extract::State;

use crate::{
    AppState,
    api::models::{
        health::{HealthResponse, InfoResponse},
        response::ApiResponse,
    },
};

/// Liveness check
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "system",
    responses(
        (status = 200, description = "Service is up", body = ApiResponse<HealthResponse>),
    )
)]
pub async fn health() -> ApiResponse<HealthResponse> {
    ApiResponse::ok(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Build and wiring information
#[utoipa::path(
    get,
    path = "/api/info",
    tag = "system",
    responses(
        (status = 200, description = "Service information", body = ApiResponse<InfoResponse>),
    )
)]
pub async fn info(State(state): State<AppState>) -> ApiResponse<InfoResponse> {
    ApiResponse::ok(InfoResponse {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.config.environment.to_string(),
        auth_driver: state.auth.driver_name().to_string(),
        gateway_enabled: state.gateway.is_some(),
    })
}
