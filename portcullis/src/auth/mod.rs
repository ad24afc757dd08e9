//! Authentication and authorization.
//!
//! # Authentication
//!
//! Identity is established by exactly one configured [`drivers::AuthDriver`]:
//! - **mock**: deterministic local identities, refused in production
//! - **federated**: redirect ceremony with an external identity provider
//!
//! A successful callback regenerates the session id (fixation protection), stores the principal
//! and stamps the authentication time used by step-up checks. See [`session`].
//!
//! # Authorization
//!
//! Route gates live in [`middleware`]:
//! - `require_authenticated`: a valid principal must be present
//! - `optional_authenticated`: attach the principal if there is one
//! - `require_role`: holds at least one of the listed roles
//! - `require_recent_authentication`: logged in within the last N minutes
//!
//! State-changing requests additionally pass the CSRF guard in [`csrf`].
//!
//! # Usage in Handlers
//!
//! ```ignore
//! use portcullis::auth::current_user::CurrentUser;
//!
//! async fn protected_handler(CurrentUser(user): CurrentUser) -> String {
//!     format!("Hello, {}!", user.name)
//! }
//! ```

pub mod csrf;
pub mod current_user;
pub mod drivers;
pub mod middleware;
pub mod principal;
pub mod service;
pub mod session;
