//! API request and response data models.
//!
//! All models are annotated with `utoipa` so they appear in the OpenAPI document.

pub mod auth;
pub mod health;
pub mod response;
