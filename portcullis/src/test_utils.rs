//! Test utilities (available with the `test-utils` feature).

use axum::{body::Body, extract::Request, http::header};
use axum_test::TestResponse;
use std::sync::Arc;

use crate::{
    AppState,
    audit::{AuditSink, MemoryAuditSink},
    config::{Config, Environment},
    session::Session,
};

pub const TEST_COOKIE_NAME: &str = "portcullis.sid";

pub fn create_test_config() -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 3001,
        environment: Environment::Test,
        secret_key: Some("test-secret-key-for-testing-only-0123456789".to_string()),
        ..Default::default()
    };
    config.session.cookie_name = TEST_COOKIE_NAME.to_string();
    config.auth.driver = "mock".to_string();
    config
}

/// State built from [`create_test_config`] whose audit events are captured in memory.
pub fn create_test_state() -> (AppState, Arc<MemoryAuditSink>) {
    create_test_state_with(create_test_config())
}

pub fn create_test_state_with(config: Config) -> (AppState, Arc<MemoryAuditSink>) {
    let mut state = AppState::from_config(config).expect("test config builds");
    let audit = Arc::new(MemoryAuditSink::default());
    state.audit = audit.clone() as Arc<dyn AuditSink>;
    (state, audit)
}

/// The `name=value` pair of a live session cookie set by `response`, if any.
pub fn cookie_pair(response: &TestResponse) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .find(|pair| pair.starts_with(&format!("{TEST_COOKIE_NAME}=")) && !pair.ends_with('='))
        .map(str::to_string)
}

/// A request carrying `session` in its extensions, as if the session middleware had run.
pub fn request_with_session(method: &str, path: &str, session: &Session) -> Request {
    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .expect("valid test request");
    request.extensions_mut().insert(session.clone());
    request
}
