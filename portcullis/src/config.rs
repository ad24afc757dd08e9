//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `PORTCULLIS_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `PORTCULLIS_` override YAML values
//! 3. **Platform variables** - `EXTERNAL_URL` and `EXTERNAL_HOSTNAME`, as injected by most PaaS
//!    runtimes, populate `platform.external_url` and `platform.external_hostname`
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `PORTCULLIS_AUTH__DRIVER=federated` sets the `auth.driver` field.
//!
//! ## Configuration Structure
//!
//! - **Server**: `host`, `port`, `environment`, `trust_proxy`
//! - **Security**: `secret_key`, `session`, `csrf`, `cors`
//! - **Authentication**: `auth.driver`, `auth.callback_url`, `auth.mock`, `auth.federated`
//! - **Gateway**: `gateway.base_url`, `gateway.oauth` - private backend and client-credentials
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! PORTCULLIS_PORT=8080
//! PORTCULLIS_ENVIRONMENT=production
//! PORTCULLIS_SECRET_KEY="$(openssl rand -base64 48)"
//! PORTCULLIS_GATEWAY__OAUTH__CLIENT_SECRET=...
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::auth::drivers::{federated, mock};
use crate::auth::principal::Principal;
use crate::errors::Error;
use crate::gateway::token_cache::OAuthClientConfig;

/// Minimum length of `secret_key` accepted in production
pub const MIN_SECRET_KEY_LENGTH: usize = 32;

/// Stands in for secret values in `Debug` output.
const REDACTED: &str = "<redacted>";

fn redact(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| REDACTED)
}

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "PORTCULLIS_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Deployment environment. Controls cookie security, callback URL protocol and the mock driver guard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Production => "production",
        };
        f.write_str(name)
    }
}

/// Main application configuration.
///
/// All fields have sensible defaults defined in the `Default` implementation. `Debug` redacts
/// every secret, so the whole value can be logged.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    pub environment: Environment,
    /// Secret used to sign session cookies and federated relay state (required in production)
    pub secret_key: Option<String>,
    /// Where the SPA lives; the auth callback redirects here
    pub frontend_url: Url,
    /// Public base URL of this server's API (e.g., "https://bff.example.com/api")
    pub public_api_url: Option<Url>,
    /// Take the client IP from `X-Forwarded-For` instead of the socket peer
    pub trust_proxy: bool,
    /// Export traces via OTLP (configured through the standard `OTEL_*` variables)
    pub enable_otel_export: bool,
    pub session: SessionConfig,
    pub csrf: CsrfConfig,
    pub cors: CorsConfig,
    pub auth: AuthConfig,
    pub gateway: GatewayConfig,
    /// Values injected by the hosting platform
    pub platform: PlatformConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("environment", &self.environment)
            .field("secret_key", &redact(&self.secret_key))
            .field("frontend_url", &self.frontend_url)
            .field("public_api_url", &self.public_api_url)
            .field("trust_proxy", &self.trust_proxy)
            .field("enable_otel_export", &self.enable_otel_export)
            .field("session", &self.session)
            .field("csrf", &self.csrf)
            .field("cors", &self.cors)
            .field("auth", &self.auth)
            .field("gateway", &self.gateway)
            .field("platform", &self.platform)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            environment: Environment::Development,
            secret_key: None,
            frontend_url: Url::parse("http://localhost:5173").expect("static URL is valid"),
            public_api_url: None,
            trust_proxy: false,
            enable_otel_export: false,
            session: SessionConfig::default(),
            csrf: CsrfConfig::default(),
            cors: CorsConfig::default(),
            auth: AuthConfig::default(),
            gateway: GatewayConfig::default(),
            platform: PlatformConfig::default(),
        }
    }
}

/// Session cookie configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub cookie_name: String,
    /// Cookie `Max-Age` and server-side time-to-live
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Extend the expiry on every request
    pub rolling: bool,
    /// Upper bound on sessions held by the in-memory store
    pub max_capacity: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "portcullis.sid".to_string(),
            max_age: Duration::from_secs(8 * 60 * 60), // 8 hours
            rolling: true,
            max_capacity: 100_000,
        }
    }
}

/// CSRF guard configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CsrfConfig {
    /// Header carrying the token, both on responses and on mutations
    pub header_name: String,
    /// Body field accepted instead of the header (JSON or form-encoded bodies)
    pub body_field: String,
    /// Paths that bypass the guard entirely
    pub exempt_paths: Vec<String>,
    /// Largest request body buffered while looking for the body field
    pub max_body_bytes: usize,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            header_name: "x-csrf-token".to_string(),
            body_field: "_csrf".to_string(),
            exempt_paths: vec![
                "/api/health".to_string(),
                "/api/info".to_string(),
                "/api/auth/callback".to_string(),
            ],
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// CORS origin specification.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    pub allowed_origins: Vec<CorsOrigin>,
    /// Preflight cache lifetime in seconds
    pub max_age: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Url(
                Url::parse("http://localhost:5173").expect("static URL is valid"), // Vite dev server
            )],
            max_age: Some(3600),
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Active driver: `mock` or `federated`. Checked when the auth service is built.
    pub driver: String,
    /// Explicit callback URL; overrides every derived value
    pub callback_url: Option<Url>,
    pub mock: MockAuthConfig,
    pub federated: FederatedAuthConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            driver: "mock".to_string(),
            callback_url: None,
            mock: MockAuthConfig::default(),
            federated: FederatedAuthConfig::default(),
        }
    }
}

/// Mock driver identities. `None` uses the built-in developer/admin/user trio.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MockAuthConfig {
    pub users: Option<Vec<Principal>>,
}

/// Signature algorithm of the identity provider's assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum AssertionAlgorithm {
    #[default]
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    HS256,
}

/// Federated (SAML-style) identity provider settings.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FederatedAuthConfig {
    /// Our service provider entity id, sent as the request issuer
    pub entity_id: String,
    /// Expected audience of assertions; defaults to `entity_id`
    pub audience: Option<String>,
    /// Identity provider single-sign-on endpoint
    pub idp_sso_url: Option<Url>,
    /// Identity provider single-logout endpoint
    pub idp_slo_url: Option<Url>,
    /// Expected issuer of assertions
    pub idp_issuer: String,
    /// PEM encoded public key or certificate key of the identity provider
    pub idp_public_key: Option<String>,
    /// Shared secret, only for `HS256`
    pub idp_shared_secret: Option<String>,
    pub algorithm: AssertionAlgorithm,
    /// Tolerated clock difference when checking not-before / not-after
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// How long a login ceremony may take before its relay state is refused
    #[serde(with = "humantime_serde")]
    pub relay_state_ttl: Duration,
    pub attributes: AttributeMapping,
    /// Role granted when the assertion carries none
    pub default_role: Option<String>,
}

impl std::fmt::Debug for FederatedAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedAuthConfig")
            .field("entity_id", &self.entity_id)
            .field("audience", &self.audience)
            .field("idp_sso_url", &self.idp_sso_url)
            .field("idp_slo_url", &self.idp_slo_url)
            .field("idp_issuer", &self.idp_issuer)
            .field("idp_public_key", &self.idp_public_key)
            .field("idp_shared_secret", &redact(&self.idp_shared_secret))
            .field("algorithm", &self.algorithm)
            .field("clock_skew", &self.clock_skew)
            .field("relay_state_ttl", &self.relay_state_ttl)
            .field("attributes", &self.attributes)
            .field("default_role", &self.default_role)
            .finish()
    }
}

impl Default for FederatedAuthConfig {
    fn default() -> Self {
        Self {
            entity_id: "portcullis".to_string(),
            audience: None,
            idp_sso_url: None,
            idp_slo_url: None,
            idp_issuer: String::new(),
            idp_public_key: None,
            idp_shared_secret: None,
            algorithm: AssertionAlgorithm::default(),
            clock_skew: Duration::from_secs(60),
            relay_state_ttl: Duration::from_secs(10 * 60),
            attributes: AttributeMapping::default(),
            default_role: None,
        }
    }
}

/// Assertion attribute names mapped onto principal fields.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttributeMapping {
    pub id: String,
    pub email: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub roles: String,
}

impl Default for AttributeMapping {
    fn default() -> Self {
        Self {
            id: "sub".to_string(),
            email: "email".to_string(),
            name: "name".to_string(),
            first_name: "given_name".to_string(),
            last_name: "family_name".to_string(),
            roles: "roles".to_string(),
        }
    }
}

/// Private backend the data routes are proxied to.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub base_url: Option<Url>,
    pub oauth: OAuthSettings,
    /// Roles allowed through to the backend (any one suffices); empty admits every principal
    pub required_roles: Vec<String>,
    /// Require a login this recent (minutes) for mutating data requests
    pub reauth_max_age_minutes: Option<u64>,
}

/// Raw OAuth client-credentials settings. All absent disables the gateway.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OAuthSettings {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    /// Defaults to the Microsoft identity platform endpoint of `tenant_id`
    pub token_endpoint: Option<Url>,
}

impl std::fmt::Debug for OAuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSettings")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("scope", &self.scope)
            .field("token_endpoint", &self.token_endpoint)
            .finish()
    }
}

impl OAuthSettings {
    fn is_empty(&self) -> bool {
        self.tenant_id.is_none()
            && self.client_id.is_none()
            && self.client_secret.is_none()
            && self.scope.is_none()
            && self.token_endpoint.is_none()
    }

    /// Resolve into a complete client configuration.
    ///
    /// Returns `Ok(None)` when nothing is configured and an error when only part of it is.
    pub fn resolve(&self) -> Result<Option<OAuthClientConfig>, Error> {
        if self.is_empty() {
            return Ok(None);
        }

        let missing = |field: &str| Error::Configuration {
            message: format!("gateway.oauth is partially configured: {field} is missing"),
        };

        let client_id = self.client_id.clone().ok_or_else(|| missing("client_id"))?;
        let client_secret = self.client_secret.clone().ok_or_else(|| missing("client_secret"))?;
        let scope = self.scope.clone().ok_or_else(|| missing("scope"))?;
        let tenant_id = self.tenant_id.clone().unwrap_or_default();

        let token_endpoint = match (&self.token_endpoint, self.tenant_id.as_deref()) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(tenant)) => Url::parse(&format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"))
                .map_err(|e| Error::Configuration {
                    message: format!("gateway.oauth.tenant_id does not form a valid token endpoint: {e}"),
                })?,
            (None, None) => return Err(missing("token_endpoint or tenant_id")),
        };

        Ok(Some(OAuthClientConfig {
            tenant_id,
            client_id,
            client_secret,
            scope,
            token_endpoint,
        }))
    }
}

/// Values the hosting platform injects, read from raw environment variables.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformConfig {
    /// Full external URL of this service (`EXTERNAL_URL`)
    pub external_url: Option<Url>,
    /// External hostname of this service, served over https (`EXTERNAL_HOSTNAME`)
    pub external_hostname: Option<String>,
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.environment.is_production() {
            match self.secret_key.as_deref() {
                None => {
                    return Err(Error::Configuration {
                        message: "secret_key is required in production. \
                         Please set PORTCULLIS_SECRET_KEY environment variable or add secret_key to config file."
                            .to_string(),
                    });
                }
                Some(key) if key.len() < MIN_SECRET_KEY_LENGTH => {
                    return Err(Error::Configuration {
                        message: format!("secret_key must be at least {MIN_SECRET_KEY_LENGTH} characters in production"),
                    });
                }
                Some(_) => {}
            }
        }

        match self.auth.driver.as_str() {
            mock::DRIVER_NAME if self.environment.is_production() => {
                return Err(Error::Configuration {
                    message: "auth.driver 'mock' cannot be used in production".to_string(),
                });
            }
            mock::DRIVER_NAME | federated::DRIVER_NAME => {}
            other => {
                return Err(Error::Configuration {
                    message: format!("Unsupported auth driver '{other}', expected 'mock' or 'federated'"),
                });
            }
        }

        if self.session.max_age.is_zero() {
            return Err(Error::Configuration {
                message: "session.max_age must be greater than zero".to_string(),
            });
        }

        if self.session.cookie_name.is_empty() || self.csrf.header_name.is_empty() {
            return Err(Error::Configuration {
                message: "session.cookie_name and csrf.header_name must not be empty".to_string(),
            });
        }

        if self.cors.allowed_origins.iter().any(|o| matches!(o, CorsOrigin::Wildcard)) {
            return Err(Error::Configuration {
                message: "cors.allowed_origins cannot contain '*': session cookies require credentialed CORS".to_string(),
            });
        }

        if self.gateway.oauth.resolve()?.is_some() && self.gateway.base_url.is_none() {
            return Err(Error::Configuration {
                message: "gateway.oauth is configured but gateway.base_url is not".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("PORTCULLIS_").ignore(&["CONFIG"]).split("__"))
            // Platform-injected variables
            .merge(Env::raw().only(&["EXTERNAL_URL"]).map(|_| "platform.external_url".into()))
            .merge(
                Env::raw()
                    .only(&["EXTERNAL_HOSTNAME"])
                    .map(|_| "platform.external_hostname".into()),
            )
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
