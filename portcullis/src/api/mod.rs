//! HTTP surface of the backend-for-frontend.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response data structures
//!
//! # API Structure
//!
//! Everything is mounted under `/api`:
//!
//! - **Health** (`/api/health`, `/api/info`): liveness and build information
//! - **Authentication** (`/api/auth/*`): login ceremony, callback, logout, current user
//! - **CSRF** (`/api/csrf-token`): token for state-changing requests
//! - **Data** (`/api/data/*`): authenticated proxy to the private backend
//!
//! The OpenAPI document is served at `/api/openapi.json`.

pub mod handlers;
pub mod models;
