//! Pluggable identity strategies.
//!
//! A driver knows how to start a login ceremony, how to turn the identity provider's callback into
//! a [`Principal`], and where (if anywhere) the provider wants the user agent sent on logout.
//! Writing the principal into the session is shared by every driver through the provided
//! [`AuthDriver::callback`] method, so fixation protection cannot be forgotten by a new driver.
//!
//! Login and callback are separate HTTP exchanges. Drivers keep no in-memory state between them;
//! anything that must correlate the two travels with the user agent.

use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

use crate::{
    auth::{
        principal::{self, Principal},
        session::establish_session,
    },
    config::Config,
    crypto::Signer,
    errors::Error,
    session::Session,
};

pub mod assertion;
pub mod federated;
pub mod mock;

/// The parts of an auth request a driver may look at.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub query: HashMap<String, String>,
    /// Form fields of a POSTed callback
    pub form: HashMap<String, String>,
}

impl AuthContext {
    pub fn from_query(query: HashMap<String, String>) -> Self {
        Self {
            query,
            form: HashMap::new(),
        }
    }

    /// Look a parameter up in the form body first, then in the query string.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.form.get(name).or_else(|| self.query.get(name)).map(String::as_str)
    }
}

#[async_trait]
pub trait AuthDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start the ceremony. Returns the URL the user agent is redirected to.
    fn login(&self, ctx: &AuthContext) -> Result<String, Error>;

    /// Establish who the caller is from the callback request.
    ///
    /// Must fail rather than fall back to some identity when the provider's answer cannot be
    /// trusted.
    async fn verify_callback(&self, ctx: &AuthContext) -> Result<Principal, Error>;

    /// Provider-side logout endpoint, if any
    fn logout_url(&self) -> Option<String> {
        None
    }

    /// Complete the ceremony and bind the principal to the session.
    async fn callback(&self, ctx: &AuthContext, session: &Session) -> Result<Principal, Error> {
        let principal = self.verify_callback(ctx).await?;
        establish_session(session, &principal).await?;
        Ok(principal)
    }

    /// Destroy the local session. Returns where to send the user agent next, if the provider
    /// has its own logout.
    async fn logout(&self, session: &Session) -> Result<Option<String>, Error> {
        session.destroy().await?;
        Ok(self.logout_url())
    }

    fn get_user(&self, session: &Session) -> Option<Principal> {
        session.raw_user().as_ref().and_then(principal::decode)
    }

    /// True iff the principal holds at least one of `roles`.
    fn has_role(&self, principal: &Principal, roles: &[String]) -> bool {
        principal.has_any_role(roles)
    }
}

/// Create the configured driver.
///
/// This is the single point where configuration becomes a driver instance; an unknown driver
/// name fails here, at startup, rather than on the first login.
pub fn create_driver(config: &Config, callback_url: &str, signer: Arc<Signer>) -> Result<Box<dyn AuthDriver>, Error> {
    match config.auth.driver.as_str() {
        mock::DRIVER_NAME => Ok(Box::new(mock::MockDriver::new(
            &config.auth.mock,
            config.environment,
            callback_url,
        )?)),
        federated::DRIVER_NAME => Ok(Box::new(federated::FederatedDriver::new(
            &config.auth.federated,
            callback_url,
            signer,
        )?)),
        other => Err(Error::Configuration {
            message: format!("Unsupported auth driver '{other}', expected 'mock' or 'federated'"),
        }),
    }
}
