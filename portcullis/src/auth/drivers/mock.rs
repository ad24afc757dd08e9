//! Deterministic local identities for development and tests.

use async_trait::async_trait;
use serde_json::Number;
use std::collections::HashMap;
use tracing::{debug, instrument};
use url::Url;

use super::{AuthContext, AuthDriver};
use crate::{
    auth::principal::{AttributeValue, Principal},
    config::{Environment, MockAuthConfig},
    errors::Error,
};

pub const DRIVER_NAME: &str = "mock";

/// Query parameter carrying the zero-based identity index
pub const USER_SELECTOR: &str = "user";

/// Identities used when the configuration lists none.
pub fn default_users() -> Vec<Principal> {
    let attributes = |department: &str, level: u64| {
        Some(HashMap::from([
            ("department".to_string(), AttributeValue::String(department.to_string())),
            ("level".to_string(), AttributeValue::Number(Number::from(level))),
        ]))
    };

    vec![
        Principal {
            attributes: attributes("Engineering", 2),
            ..Principal::new("mock-developer-001", "developer@example.com", "Dev Developer").with_roles(["developer", "user"])
        },
        Principal {
            attributes: attributes("Operations", 3),
            ..Principal::new("mock-admin-001", "admin@example.com", "Ada Admin").with_roles(["admin", "user"])
        },
        Principal {
            attributes: attributes("Sales", 1),
            ..Principal::new("mock-user-001", "user@example.com", "Uma User").with_roles(["user"])
        },
    ]
}

pub struct MockDriver {
    users: Vec<Principal>,
    callback_url: String,
}

impl MockDriver {
    /// Refuses to exist in production.
    pub fn new(config: &MockAuthConfig, environment: Environment, callback_url: &str) -> Result<Self, Error> {
        if environment.is_production() {
            return Err(Error::Configuration {
                message: "Mock auth driver cannot be used in production".to_string(),
            });
        }

        let users = config.users.clone().unwrap_or_else(default_users);
        if users.is_empty() {
            return Err(Error::Configuration {
                message: "auth.mock.users must list at least one identity".to_string(),
            });
        }

        Ok(Self {
            users,
            callback_url: callback_url.to_string(),
        })
    }

    fn selector(ctx: &AuthContext) -> usize {
        ctx.param(USER_SELECTOR).and_then(|s| s.parse().ok()).unwrap_or(0)
    }
}

#[async_trait]
impl AuthDriver for MockDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn login(&self, ctx: &AuthContext) -> Result<String, Error> {
        let mut url = Url::parse(&self.callback_url).map_err(|e| Error::Configuration {
            message: format!("invalid callback URL {}: {e}", self.callback_url),
        })?;
        url.query_pairs_mut()
            .append_pair(USER_SELECTOR, &Self::selector(ctx).to_string());
        Ok(url.into())
    }

    #[instrument(skip_all)]
    async fn verify_callback(&self, ctx: &AuthContext) -> Result<Principal, Error> {
        let index = Self::selector(ctx);
        // Unknown selectors fall back to the first identity
        let principal = self.users.get(index).or_else(|| self.users.first()).cloned().ok_or_else(|| Error::Configuration {
            message: "auth.mock.users must list at least one identity".to_string(),
        })?;
        debug!(index, user_id = %principal.id, "Mock identity selected");
        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALLBACK: &str = "http://localhost:3001/api/auth/callback";

    fn driver() -> MockDriver {
        MockDriver::new(&MockAuthConfig::default(), Environment::Development, CALLBACK).unwrap()
    }

    fn ctx(user: &str) -> AuthContext {
        AuthContext::from_query(HashMap::from([(USER_SELECTOR.to_string(), user.to_string())]))
    }

    #[test]
    fn test_default_identities_have_distinct_roles() {
        let users = default_users();
        assert_eq!(users.len(), 3);
        assert_eq!(users[0].roles(), ["developer", "user"]);
        assert_eq!(users[1].roles(), ["admin", "user"]);
        assert_eq!(users[2].roles(), ["user"]);
    }

    #[test]
    fn test_login_redirects_to_own_callback_with_selector() {
        let driver = driver();
        assert_eq!(driver.login(&AuthContext::default()).unwrap(), format!("{CALLBACK}?user=0"));
        assert_eq!(driver.login(&ctx("2")).unwrap(), format!("{CALLBACK}?user=2"));
        assert_eq!(driver.login(&ctx("bogus")).unwrap(), format!("{CALLBACK}?user=0"));
    }

    #[tokio::test]
    async fn test_callback_selects_identity() {
        let driver = driver();
        assert_eq!(driver.verify_callback(&ctx("1")).await.unwrap().id, "mock-admin-001");
        assert_eq!(driver.verify_callback(&AuthContext::default()).await.unwrap().id, "mock-developer-001");
    }

    #[tokio::test]
    async fn test_callback_never_fails_on_unknown_selector() {
        let driver = driver();
        for selector in ["3", "999", "-1", "admin", ""] {
            let principal = driver.verify_callback(&ctx(selector)).await.unwrap();
            assert_eq!(principal.id, "mock-developer-001", "selector {selector:?}");
        }
    }

    #[test]
    fn test_production_guard() {
        let err = MockDriver::new(&MockAuthConfig::default(), Environment::Production, CALLBACK)
            .err()
            .unwrap();
        assert!(err.to_string().contains("cannot be used in production"));
    }

    #[test]
    fn test_configured_identities_replace_defaults() {
        let config = MockAuthConfig {
            users: Some(vec![Principal::new("only", "only@example.com", "Only One")]),
        };
        let driver = MockDriver::new(&config, Environment::Test, CALLBACK).unwrap();
        assert_eq!(driver.users.len(), 1);

        let empty = MockAuthConfig { users: Some(vec![]) };
        assert!(MockDriver::new(&empty, Environment::Test, CALLBACK).is_err());
    }
}
