//! # portcullis: authentication and session security for a backend-for-frontend
//!
//! `portcullis` sits between a single-page application and a private backend API. The browser
//! only ever holds an opaque, signed session cookie; identities come from a pluggable auth driver,
//! and calls to the backend are made server-side with OAuth2 client-credentials tokens that never
//! reach the browser.
//!
//! ## Request Flow
//!
//! Every request passes through the same layers, outermost first:
//!
//! 1. **Tracing**: one span per request
//! 2. **CORS**: credentialed, explicit origins only
//! 3. **Session** ([`session`]): resolves the signed cookie into a [`session::Session`] and
//!    persists it after the handler ran
//! 4. **CSRF** ([`auth::csrf`]): mutations must carry a token derived from the session secret;
//!    safe requests receive a fresh one in a response header
//!
//! Routes then add their own gates from [`auth::middleware`] (authenticated, role, recent login)
//! before reaching the handlers in [`api`].
//!
//! ## Login
//!
//! `GET /api/auth/login` asks the configured driver ([`auth::drivers`]) where to send the user.
//! The identity provider answers at `/api/auth/callback`; a verified principal is written into a
//! freshly regenerated session and the user is redirected to the frontend.
//!
//! ## Data Gateway
//!
//! `/api/data/*` is forwarded to the backend by [`gateway::GatewayProxy`] with a cached bearer
//! token. The backend's status and body are returned unchanged.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use portcullis::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = portcullis::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     portcullis::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     Application::new(config)?
//!         .serve(async {
//!             tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!         })
//!         .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod gateway;
mod openapi;
pub mod session;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use crate::{
    api::handlers,
    audit::{AuditSink, TracingAuditSink},
    auth::{
        middleware::{
            RecentAuthGate, RoleGate, optional_authenticated, require_authenticated, require_recent_authentication, require_role,
        },
        service::AuthService,
    },
    config::CorsOrigin,
    crypto::{Signer, random_token},
    errors::Error,
    gateway::GatewayProxy,
    openapi::ApiDoc,
    session::{
        session_middleware,
        store::{MemorySessionStore, SessionStore},
    },
};
use axum::{
    Json, Router,
    http::{self, HeaderName, HeaderValue, Method},
    middleware::from_fn_with_state,
    routing::{any, get, post},
};
use bon::Builder;
pub use config::Config;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument, warn};
use utoipa::OpenApi;

/// Shared state handed to every handler and middleware.
///
/// # Fields
///
/// - `config`: Application configuration loaded from environment/files
/// - `auth`: The configured auth driver and its callback URL
/// - `sessions`: Server-side session records
/// - `signer`: HMAC signer keyed with the process secret (cookies, relay state)
/// - `gateway`: Backend proxy, absent when no backend is configured
/// - `audit`: Destination of security events
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .auth(auth)
///     .sessions(sessions)
///     .signer(signer)
///     .audit(Arc::new(TracingAuditSink))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub auth: Arc<AuthService>,
    pub sessions: Arc<dyn SessionStore>,
    pub signer: Arc<Signer>,
    pub gateway: Option<Arc<GatewayProxy>>,
    pub audit: Arc<dyn AuditSink>,
}

impl AppState {
    /// Construct every component from configuration.
    ///
    /// Fails when the configured driver cannot be built, so a misconfigured process never
    /// starts serving.
    pub fn from_config(config: Config) -> Result<Self, Error> {
        let secret = match config.secret_key.as_deref() {
            Some(secret) => secret.to_string(),
            None => {
                warn!("No secret_key configured, using an ephemeral key: sessions will not survive a restart");
                random_token::<48>()
            }
        };
        let signer = Arc::new(Signer::new(secret));

        let auth = Arc::new(AuthService::from_config(&config, signer.clone())?);
        let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(config.session.max_age, config.session.max_capacity));
        let gateway = GatewayProxy::from_config(&config.gateway)?.map(Arc::new);
        if gateway.is_none() {
            info!("No gateway backend configured, /api/data is disabled");
        }

        Ok(Self::builder()
            .config(config)
            .auth(auth)
            .sessions(sessions)
            .signer(signer)
            .maybe_gateway(gateway)
            .audit(Arc::new(TracingAuditSink))
            .build())
    }
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let mut origins = Vec::new();
    for origin in &config.cors.allowed_origins {
        let header_value = match origin {
            CorsOrigin::Wildcard => anyhow::bail!("cors.allowed_origins cannot contain '*' with credentialed requests"),
            CorsOrigin::Url(url) => url.as_str().trim_end_matches('/').parse::<HeaderValue>()?,
        };
        origins.push(header_value);
    }

    let csrf_header = HeaderName::try_from(config.csrf.header_name.as_str())?;

    let mut cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([http::header::CONTENT_TYPE, http::header::ACCEPT, csrf_header.clone()])
        .expose_headers([csrf_header, http::header::LOCATION]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router with all endpoints and middleware.
///
/// Route gates are attached per route; session, CSRF, CORS and tracing wrap everything.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let authenticated = || from_fn_with_state(state.clone(), require_authenticated);

    let auth_routes = Router::new()
        .route("/auth/login", get(handlers::auth::login))
        .route("/auth/callback", get(handlers::auth::callback).post(handlers::auth::callback))
        .route("/auth/logout", post(handlers::auth::logout).route_layer(authenticated()))
        .route("/auth/me", get(handlers::auth::me).route_layer(authenticated()))
        .route(
            "/auth/status",
            get(handlers::auth::status).route_layer(from_fn_with_state(state.clone(), optional_authenticated)),
        )
        .route("/csrf-token", get(handlers::csrf::get_token));

    // Innermost first: the step-up and role gates need the principal attached by `authenticated`
    let gateway = &state.config.gateway;
    let mut data = Router::new().route("/data/{*path}", any(handlers::data::proxy));
    if let Some(max_age_minutes) = gateway.reauth_max_age_minutes {
        let gate = RecentAuthGate {
            state: state.clone(),
            max_age_minutes,
            mutations_only: true,
        };
        data = data.route_layer(from_fn_with_state(gate, require_recent_authentication));
    }
    if !gateway.required_roles.is_empty() {
        let gate = RoleGate::new(state.clone(), gateway.required_roles.iter().cloned());
        data = data.route_layer(from_fn_with_state(gate, require_role));
    }
    let data = data.route_layer(authenticated());

    let api = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/info", get(handlers::health::info))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .merge(auth_routes)
        .merge(data);

    let router = Router::new()
        .nest("/api", api)
        .layer(from_fn_with_state(state.clone(), auth::csrf::csrf_middleware))
        .layer(from_fn_with_state(state.clone(), session_middleware))
        .layer(create_cors_layer(&state.config)?)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state.clone());

    Ok(router)
}

pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Create a new application instance with all components initialized
    pub fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting portcullis with configuration: {:#?}", config);
        config.validate()?;

        let state = AppState::from_config(config.clone())?;
        let router = build_router(&state)?;

        Ok(Self { router, config })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("portcullis listening on http://{}", bind_addr);

        // Peer addresses feed the audit trail when no trusted proxy is in front
        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        auth::drivers::federated::{RELAY_STATE, SAML_RESPONSE},
        config::{AssertionAlgorithm, OAuthSettings},
        test_utils::{cookie_pair, create_test_config},
    };
    use axum::http::{StatusCode, header};
    use axum_test::{TestResponse, TestServer};
    use serde_json::{Value, json};
    use url::Url;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn server(config: Config) -> TestServer {
        Application::new(config).unwrap().into_test_server()
    }

    fn location(response: &TestResponse) -> String {
        response.headers()[header::LOCATION].to_str().unwrap().to_string()
    }

    /// Path and query of an absolute URL, for replaying redirects against the test server
    fn local_path(url: &str) -> String {
        let url = Url::parse(url).unwrap();
        match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        }
    }

    /// Run the mock login for identity `index`; returns the session cookie and a CSRF token
    async fn login_as(server: &TestServer, index: usize) -> (String, String) {
        let response = server.get(&format!("/api/auth/login?user={index}")).await;
        response.assert_status(StatusCode::FOUND);

        let response = server.get(&local_path(&location(&response))).await;
        response.assert_status(StatusCode::FOUND);
        let cookie = cookie_pair(&response).expect("login issues a session cookie");

        let response = server.get("/api/csrf-token").add_header("cookie", cookie.clone()).await;
        response.assert_status_ok();
        let body: Value = response.json();
        let token = body["data"]["token"].as_str().unwrap().to_string();
        (cookie, token)
    }

    #[test_log::test(tokio::test)]
    async fn test_health_and_info() {
        let server = server(create_test_config());

        let response = server.get("/api/health").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body, json!({ "success": true, "data": { "status": "ok" } }));

        let body: Value = server.get("/api/info").await.json();
        assert_eq!(body["data"]["auth_driver"], "mock");
        assert_eq!(body["data"]["gateway_enabled"], false);

        server.get("/api/openapi.json").await.assert_status_ok();
    }

    #[test_log::test(tokio::test)]
    async fn test_mock_login_me_and_logout() {
        let server = server(create_test_config());

        let body: Value = server.get("/api/auth/status").await.json();
        assert_eq!(body["data"]["authenticated"], false);
        server.get("/api/auth/me").await.assert_status(StatusCode::UNAUTHORIZED);

        let response = server.get("/api/auth/login?user=1").await;
        response.assert_status(StatusCode::FOUND);
        assert_eq!(location(&response), "http://127.0.0.1:3001/api/auth/callback?user=1");

        let callback = server.get(&local_path(&location(&response))).await;
        callback.assert_status(StatusCode::FOUND);
        assert_eq!(location(&callback), "http://localhost:5173/");
        let cookie = cookie_pair(&callback).unwrap();

        let response = server.get("/api/auth/me").add_header("cookie", cookie.clone()).await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["data"]["id"], "mock-admin-001");
        assert_eq!(body["data"]["roles"], json!(["admin", "user"]));
        let token = response.headers()["x-csrf-token"].to_str().unwrap().to_string();

        let body: Value = server.get("/api/auth/status").add_header("cookie", cookie.clone()).await.json();
        assert_eq!(body["data"]["authenticated"], true);

        // Logout is a mutation and needs the token
        let response = server.post("/api/auth/logout").add_header("cookie", cookie.clone()).await;
        response.assert_status(StatusCode::FORBIDDEN);

        let response = server
            .post("/api/auth/logout")
            .add_header("cookie", cookie.clone())
            .add_header("x-csrf-token", token)
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["data"]["redirect_url"], Value::Null);
        let cleared = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cleared.contains("Max-Age=0"));

        server
            .get("/api/auth/me")
            .add_header("cookie", cookie)
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[test_log::test(tokio::test)]
    async fn test_login_regenerates_session_id() {
        let config = create_test_config();
        let state = AppState::from_config(config).unwrap();
        let server = TestServer::new(build_router(&state).unwrap()).unwrap();

        // Anonymous session carrying a CSRF secret
        let response = server.get("/api/csrf-token").await;
        let before = cookie_pair(&response).unwrap();
        let before_id = state.signer.unseal(before.split_once('=').unwrap().1).unwrap().to_string();
        let secret = state.sessions.load(&before_id).await.unwrap().unwrap().csrf_secret;

        let response = server
            .get("/api/auth/callback?user=2")
            .add_header("cookie", before.clone())
            .await;
        let after = cookie_pair(&response).unwrap();
        let after_id = state.signer.unseal(after.split_once('=').unwrap().1).unwrap().to_string();

        assert_ne!(before_id, after_id);
        assert!(state.sessions.load(&before_id).await.unwrap().is_none());
        let record = state.sessions.load(&after_id).await.unwrap().unwrap();
        assert_eq!(record.user.unwrap()["id"], "mock-user-001");
        assert!(record.last_auth_at.is_some());
        assert_eq!(record.csrf_secret, secret);
    }

    #[test_log::test(tokio::test)]
    async fn test_forged_cookie_is_ignored() {
        let server = server(create_test_config());
        let (cookie, _) = login_as(&server, 0).await;

        let (name, value) = cookie.split_once('=').unwrap();
        let (id, _) = value.rsplit_once('.').unwrap();
        let forged = format!("{name}={id}.AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");

        server
            .get("/api/auth/me")
            .add_header("cookie", forged)
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_federated_callback_redirects_with_error() {
        let mut config = create_test_config();
        config.auth.driver = "federated".to_string();
        config.auth.federated.idp_sso_url = Some(Url::parse("https://idp.example.com/sso").unwrap());
        config.auth.federated.idp_issuer = "https://idp.example.com".to_string();
        config.auth.federated.algorithm = AssertionAlgorithm::HS256;
        config.auth.federated.idp_shared_secret = Some("idp-secret".to_string());
        let server = server(config);

        let response = server.get("/api/auth/login").await;
        response.assert_status(StatusCode::FOUND);
        let login = Url::parse(&location(&response)).unwrap();
        assert_eq!(login.host_str(), Some("idp.example.com"));
        let relay_state = login
            .query_pairs()
            .find(|(k, _)| k == RELAY_STATE)
            .map(|(_, v)| v.into_owned())
            .unwrap();

        // Form posts from the identity provider need no CSRF token
        let response = server
            .post("/api/auth/callback")
            .form(&[(SAML_RESPONSE, "not-an-assertion"), (RELAY_STATE, relay_state.as_str())])
            .await;
        response.assert_status(StatusCode::FOUND);
        assert_eq!(location(&response), "http://localhost:5173/login?error=authentication_failed");
        assert!(cookie_pair(&response).is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_data_gateway_disabled_without_backend() {
        let server = server(create_test_config());
        let (cookie, _) = login_as(&server, 0).await;

        let response = server.get("/api/data/orders").add_header("cookie", cookie).await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json();
        assert_eq!(body["error"]["code"], "GATEWAY_DISABLED");
    }

    async fn gateway_backend() -> (MockServer, Config) {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "svc-token",
                "expires_in": 3600,
            })))
            .mount(&backend)
            .await;

        let mut config = create_test_config();
        config.gateway.base_url = Some(Url::parse(&format!("{}/api/v2", backend.uri())).unwrap());
        config.gateway.oauth = OAuthSettings {
            client_id: Some("bff".to_string()),
            client_secret: Some("secret".to_string()),
            scope: Some("backend/.default".to_string()),
            token_endpoint: Some(Url::parse(&format!("{}/token", backend.uri())).unwrap()),
            ..Default::default()
        };
        config.gateway.required_roles = vec!["admin".to_string(), "developer".to_string()];
        (backend, config)
    }

    #[test_log::test(tokio::test)]
    async fn test_data_gateway_proxies_for_permitted_roles() {
        let (backend, config) = gateway_backend().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/reports/7"))
            .and(header_is("authorization", "Bearer svc-token"))
            .respond_with(ResponseTemplate::new(418).set_body_json(json!({ "teapot": true })))
            .mount(&backend)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/reports"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 8 })))
            .mount(&backend)
            .await;

        let server = server(config);
        let (cookie, token) = login_as(&server, 0).await;

        let response = server.get("/api/data/reports/7").add_header("cookie", cookie.clone()).await;
        response.assert_status(StatusCode::IM_A_TEAPOT);
        let body: Value = response.json();
        assert_eq!(body, json!({ "teapot": true }));

        let response = server
            .post("/api/data/reports")
            .add_header("cookie", cookie)
            .add_header("x-csrf-token", token)
            .json(&json!({ "title": "Q3" }))
            .await;
        response.assert_status(StatusCode::CREATED);
    }

    #[test_log::test(tokio::test)]
    async fn test_data_gateway_step_up_applies_to_mutations() {
        let (backend, mut config) = gateway_backend().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/reports"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&backend)
            .await;
        config.gateway.reauth_max_age_minutes = Some(0);

        let server = server(config);
        let (cookie, token) = login_as(&server, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let response = server.get("/api/data/reports").add_header("cookie", cookie.clone()).await;
        response.assert_status_ok();

        let response = server
            .post("/api/data/reports")
            .add_header("cookie", cookie)
            .add_header("x-csrf-token", token)
            .json(&json!({ "title": "Q4" }))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["error"]["code"], "REAUTHENTICATION_REQUIRED");
    }

    #[test_log::test(tokio::test)]
    async fn test_data_gateway_enforces_roles_and_rejects_traversal() {
        let (backend, config) = gateway_backend().await;
        let server = server(config);

        let (user_cookie, _) = login_as(&server, 2).await;
        let response = server.get("/api/data/reports/7").add_header("cookie", user_cookie).await;
        response.assert_status(StatusCode::FORBIDDEN);
        let body: Value = response.json();
        assert_eq!(body["error"]["details"]["required_roles"], json!(["admin", "developer"]));

        let (admin_cookie, _) = login_as(&server, 1).await;
        let response = server.get("/api/data/reports/..%2f..%2fsecrets").add_header("cookie", admin_cookie).await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"]["code"], "PATH_TRAVERSAL");

        // Only the token endpoint could have been hit, never the backend
        let received = backend.received_requests().await.unwrap();
        assert!(received.iter().all(|r| r.url.path() == "/token"));

        server.get("/api/data/reports").await.assert_status(StatusCode::UNAUTHORIZED);
    }
}
