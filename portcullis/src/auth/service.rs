//! The auth orchestrator: one configured driver plus the callback URL it reports to.

use std::sync::Arc;
use tracing::info;

use crate::{
    auth::{
        drivers::{AuthContext, AuthDriver, create_driver},
        principal::Principal,
    },
    config::{Config, Environment},
    crypto::Signer,
    errors::Error,
    session::Session,
};

pub struct AuthService {
    driver: Box<dyn AuthDriver>,
    callback_url: String,
}

impl AuthService {
    /// Resolve the callback URL and construct the configured driver.
    pub fn from_config(config: &Config, signer: Arc<Signer>) -> Result<Self, Error> {
        let callback_url = resolve_callback_url(config);
        let driver = create_driver(config, &callback_url, signer)?;
        info!(driver = driver.name(), callback_url, "Auth driver ready");
        Ok(Self { driver, callback_url })
    }

    pub fn with_driver(driver: Box<dyn AuthDriver>, callback_url: impl Into<String>) -> Self {
        Self {
            driver,
            callback_url: callback_url.into(),
        }
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    pub fn login(&self, ctx: &AuthContext) -> Result<String, Error> {
        self.driver.login(ctx)
    }

    pub async fn callback(&self, ctx: &AuthContext, session: &Session) -> Result<Principal, Error> {
        self.driver.callback(ctx, session).await
    }

    pub async fn logout(&self, session: &Session) -> Result<Option<String>, Error> {
        self.driver.logout(session).await
    }

    pub fn current_user(&self, session: &Session) -> Option<Principal> {
        self.driver.get_user(session)
    }

    pub fn has_role(&self, principal: &Principal, roles: &[String]) -> bool {
        self.driver.has_role(principal, roles)
    }
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
}

/// Work out the absolute URL the identity provider should send users back to.
///
/// First match wins:
/// 1. `auth.callback_url`
/// 2. `public_api_url` + `/auth/callback`
/// 3. `platform.external_url` + `/api/auth/callback`
/// 4. `https://{platform.external_hostname}/api/auth/callback`
/// 5. the bind address, with wildcard hosts shown as `localhost`
pub fn resolve_callback_url(config: &Config) -> String {
    if let Some(url) = &config.auth.callback_url {
        return url.to_string();
    }
    if let Some(url) = &config.public_api_url {
        return format!("{}/auth/callback", url.as_str().trim_end_matches('/'));
    }
    if let Some(url) = &config.platform.external_url {
        return format!("{}/api/auth/callback", url.as_str().trim_end_matches('/'));
    }
    if let Some(hostname) = config.platform.external_hostname.as_deref().filter(|h| !h.is_empty()) {
        return format!("https://{hostname}/api/auth/callback");
    }

    let host = match config.host.as_str() {
        "" | "0.0.0.0" | "::" | "[::]" => "localhost",
        host => host,
    };
    let scheme = if config.environment.is_production() { "https" } else { "http" };
    let include_port = is_loopback(host) || config.environment == Environment::Development;

    if include_port {
        format!("{scheme}://{host}:{}/api/auth/callback", config.port)
    } else {
        format!("{scheme}://{host}/api/auth/callback")
    }
}
