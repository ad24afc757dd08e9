//! Verification of identity provider assertions.
//!
//! The shipped verifier accepts a compact signed assertion (JWS) and checks signature, issuer,
//! audience, not-before and expiry. Deployments whose provider signs XML assertions plug their
//! own [`AssertionVerifier`] into the federated driver.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::{AssertionAlgorithm, FederatedAuthConfig};

#[derive(Debug, Error)]
pub enum AssertionError {
    #[error("assertion rejected: {0}")]
    Rejected(#[from] jsonwebtoken::errors::Error),

    #[error("verifier misconfigured: {0}")]
    Configuration(String),
}

/// Checks an assertion and returns its claims.
pub trait AssertionVerifier: Send + Sync {
    fn verify(&self, assertion: &str) -> Result<Map<String, Value>, AssertionError>;
}

/// Verifies JWS assertions with `jsonwebtoken`.
pub struct JwsAssertionVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwsAssertionVerifier {
    pub fn new(
        algorithm: AssertionAlgorithm,
        key: DecodingKey,
        issuer: &str,
        audience: &str,
        clock_skew: Duration,
    ) -> Self {
        let mut validation = Validation::new(to_jwt_algorithm(algorithm));
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.validate_nbf = true;
        validation.leeway = clock_skew.as_secs();

        Self { key, validation }
    }

    /// Build from the federated settings, loading the provider key.
    pub fn from_config(config: &FederatedAuthConfig) -> Result<Self, AssertionError> {
        if config.idp_issuer.is_empty() {
            return Err(AssertionError::Configuration("idp_issuer is required".to_string()));
        }

        let key = match config.algorithm {
            AssertionAlgorithm::HS256 => {
                let secret = config
                    .idp_shared_secret
                    .as_deref()
                    .ok_or_else(|| AssertionError::Configuration("idp_shared_secret is required for HS256".to_string()))?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            algorithm => {
                let pem = config
                    .idp_public_key
                    .as_deref()
                    .ok_or_else(|| AssertionError::Configuration(format!("idp_public_key is required for {algorithm:?}")))?;
                let key = match algorithm {
                    AssertionAlgorithm::ES256 | AssertionAlgorithm::ES384 => DecodingKey::from_ec_pem(pem.as_bytes()),
                    _ => DecodingKey::from_rsa_pem(pem.as_bytes()),
                };
                key.map_err(|e| AssertionError::Configuration(format!("idp_public_key is not a valid PEM key: {e}")))?
            }
        };

        let audience = config.audience.as_deref().unwrap_or(&config.entity_id);
        Ok(Self::new(
            config.algorithm,
            key,
            &config.idp_issuer,
            audience,
            config.clock_skew,
        ))
    }
}

fn to_jwt_algorithm(algorithm: AssertionAlgorithm) -> Algorithm {
    match algorithm {
        AssertionAlgorithm::RS256 => Algorithm::RS256,
        AssertionAlgorithm::RS384 => Algorithm::RS384,
        AssertionAlgorithm::RS512 => Algorithm::RS512,
        AssertionAlgorithm::ES256 => Algorithm::ES256,
        AssertionAlgorithm::ES384 => Algorithm::ES384,
        AssertionAlgorithm::HS256 => Algorithm::HS256,
    }
}

impl AssertionVerifier for JwsAssertionVerifier {
    fn verify(&self, assertion: &str) -> Result<Map<String, Value>, AssertionError> {
        let data = decode::<Map<String, Value>>(assertion, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}
