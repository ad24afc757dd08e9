//! HTTP request handlers.
//!
//! # Handler Modules
//!
//! - [`auth`]: Login ceremony, callback, logout, current user and status
//! - [`csrf`]: CSRF token issuance
//! - [`data`]: Authenticated proxy to the private backend
//! - [`health`]: Liveness and service information
//!
//! # Authentication
//!
//! Handlers do not check authentication themselves. Routes are wrapped in the gates of
//! [`crate::auth::middleware`], and handlers read the principal with
//! [`crate::auth::current_user::CurrentUser`].
//!
//! # Error Handling
//!
//! Handlers return [`crate::errors::Error`], which renders the JSON error envelope.

pub mod auth;
pub mod csrf;
pub mod data;
pub mod health;
