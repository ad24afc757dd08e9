//! Redirect-based federation with an external identity provider (SAML-style).
//!
//! `login` sends the user agent to the provider's single-sign-on endpoint with a base64 encoded
//! `AuthnRequest` and a signed `RelayState` of the form `<request id>.<issued at ms>.<hmac>`.
//! The provider posts back a `SAMLResponse` holding a signed assertion plus the untouched relay
//! state. Because the relay state is signed with the process secret and carries its own issue
//! time, the callback needs no memory of the login and survives restarts and load balancing.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{
    AuthContext, AuthDriver,
    assertion::{AssertionVerifier, JwsAssertionVerifier},
};
use crate::{
    auth::principal::{AttributeValue, Principal},
    config::{AttributeMapping, FederatedAuthConfig},
    crypto::{Signer, random_token},
    errors::Error,
};

pub const DRIVER_NAME: &str = "federated";

pub const SAML_REQUEST: &str = "SAMLRequest";
pub const SAML_RESPONSE: &str = "SAMLResponse";
pub const RELAY_STATE: &str = "RelayState";

/// Assertion claims that describe the assertion itself rather than the subject
const RESERVED_CLAIMS: &[&str] = &["iss", "aud", "exp", "nbf", "iat", "jti", "in_response_to"];

pub struct FederatedDriver {
    sso_url: Url,
    slo_url: Option<Url>,
    entity_id: String,
    callback_url: String,
    verifier: Box<dyn AssertionVerifier>,
    signer: Arc<Signer>,
    relay_state_ttl: Duration,
    attributes: AttributeMapping,
    default_role: Option<String>,
}

fn failed(reason: impl Into<String>) -> Error {
    Error::AuthenticationFailed { reason: reason.into() }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

impl FederatedDriver {
    pub fn new(config: &FederatedAuthConfig, callback_url: &str, signer: Arc<Signer>) -> Result<Self, Error> {
        let verifier = JwsAssertionVerifier::from_config(config).map_err(|e| Error::Configuration {
            message: format!("auth.federated: {e}"),
        })?;
        Self::with_verifier(config, callback_url, signer, Box::new(verifier))
    }

    pub fn with_verifier(
        config: &FederatedAuthConfig,
        callback_url: &str,
        signer: Arc<Signer>,
        verifier: Box<dyn AssertionVerifier>,
    ) -> Result<Self, Error> {
        let sso_url = config.idp_sso_url.clone().ok_or_else(|| Error::Configuration {
            message: "auth.federated.idp_sso_url is required for the federated driver".to_string(),
        })?;

        Ok(Self {
            sso_url,
            slo_url: config.idp_slo_url.clone(),
            entity_id: config.entity_id.clone(),
            callback_url: callback_url.to_string(),
            verifier,
            signer,
            relay_state_ttl: config.relay_state_ttl,
            attributes: config.attributes.clone(),
            default_role: config.default_role.clone(),
        })
    }

    fn authn_request(&self, request_id: &str, issue_instant: &str) -> String {
        format!(
            concat!(
                r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" "#,
                r#"xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0" "#,
                r#"IssueInstant="{}" Destination="{}" AssertionConsumerServiceURL="{}" "#,
                r#"ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST">"#,
                r#"<saml:Issuer>{}</saml:Issuer></samlp:AuthnRequest>"#
            ),
            xml_escape(request_id),
            issue_instant,
            xml_escape(self.sso_url.as_str()),
            xml_escape(&self.callback_url),
            xml_escape(&self.entity_id),
        )
    }

    fn relay_state(&self, request_id: &str, issued_at_ms: i64) -> String {
        self.signer.seal(&format!("{request_id}.{issued_at_ms}"))
    }

    /// Verify a relay state and return the request id it was minted for.
    fn check_relay_state(&self, relay_state: &str, now_ms: i64) -> Result<String, Error> {
        let payload = self
            .signer
            .unseal(relay_state)
            .ok_or_else(|| failed("RelayState signature is invalid"))?;

        let (request_id, issued_at) = payload
            .rsplit_once('.')
            .and_then(|(id, at)| Some((id, at.parse::<i64>().ok()?)))
            .ok_or_else(|| failed("RelayState is malformed"))?;

        let ttl_ms = i64::try_from(self.relay_state_ttl.as_millis()).unwrap_or(i64::MAX);
        if now_ms.saturating_sub(issued_at) > ttl_ms || issued_at > now_ms {
            return Err(failed("RelayState has expired"));
        }

        Ok(request_id.to_string())
    }

    /// Map assertion claims onto a principal using the configured attribute names.
    fn map_principal(&self, claims: &Map<String, Value>) -> Result<Principal, Error> {
        let names = &self.attributes;

        let id = claim_string(claims, &names.id).ok_or_else(|| failed(format!("assertion is missing the '{}' attribute", names.id)))?;
        let email =
            claim_string(claims, &names.email).ok_or_else(|| failed(format!("assertion is missing the '{}' attribute", names.email)))?;

        let full_name = [claim_string(claims, &names.first_name), claim_string(claims, &names.last_name)]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        let name = claim_string(claims, &names.name)
            .or_else(|| (!full_name.is_empty()).then_some(full_name))
            .unwrap_or_else(|| email.clone());

        let mut roles = claim_list(claims, &names.roles);
        if roles.is_empty()
            && let Some(default_role) = &self.default_role
        {
            roles.push(default_role.clone());
        }

        let mapped = [&names.id, &names.email, &names.name, &names.first_name, &names.last_name, &names.roles];
        let attributes: HashMap<String, AttributeValue> = claims
            .iter()
            .filter(|(key, _)| !RESERVED_CLAIMS.contains(&key.as_str()) && !mapped.contains(key))
            .filter_map(|(key, value)| Some((key.clone(), scalar(value)?)))
            .collect();

        Ok(Principal {
            id,
            email,
            name,
            roles: (!roles.is_empty()).then_some(roles),
            attributes: (!attributes.is_empty()).then_some(attributes),
        })
    }
}

/// A single-valued attribute. Multi-valued attributes yield their first value.
fn claim_string(claims: &Map<String, Value>, name: &str) -> Option<String> {
    let value = match claims.get(name)? {
        Value::Array(values) => values.first()?,
        value => value,
    };
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// A multi-valued attribute, given either as an array or a comma separated string.
fn claim_list(claims: &Map<String, Value>, name: &str) -> Vec<String> {
    let values: Vec<&str> = match claims.get(name) {
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
        Some(Value::String(s)) => s.split(',').collect(),
        _ => Vec::new(),
    };
    values
        .into_iter()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn scalar(value: &Value) -> Option<AttributeValue> {
    match value {
        Value::Bool(b) => Some(AttributeValue::Bool(*b)),
        Value::Number(n) => Some(AttributeValue::Number(n.clone())),
        Value::String(s) => Some(AttributeValue::String(s.clone())),
        Value::Null => Some(AttributeValue::Null),
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[async_trait]
impl AuthDriver for FederatedDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn login(&self, _ctx: &AuthContext) -> Result<String, Error> {
        let request_id = format!("_{}", random_token::<16>());
        let now = Utc::now();
        let request = self.authn_request(&request_id, &now.to_rfc3339_opts(SecondsFormat::Secs, true));
        let relay_state = self.relay_state(&request_id, now.timestamp_millis());

        let mut url = self.sso_url.clone();
        url.query_pairs_mut()
            .append_pair(SAML_REQUEST, &BASE64_STANDARD.encode(request))
            .append_pair(RELAY_STATE, &relay_state);

        debug!(request_id, "Redirecting to identity provider");
        Ok(url.into())
    }

    #[instrument(skip_all, err)]
    async fn verify_callback(&self, ctx: &AuthContext) -> Result<Principal, Error> {
        let relay_state = ctx.param(RELAY_STATE).ok_or_else(|| failed("RelayState is missing"))?;
        let request_id = self.check_relay_state(relay_state, Utc::now().timestamp_millis())?;

        let assertion = ctx.param(SAML_RESPONSE).ok_or_else(|| failed("SAMLResponse is missing"))?;
        let claims = self.verifier.verify(assertion).map_err(|e| {
            warn!(error = %e, "Identity provider assertion rejected");
            failed(e.to_string())
        })?;

        // Every login starts here, so the assertion must name the request it answers
        match claims.get("in_response_to").and_then(Value::as_str) {
            Some(in_response_to) if in_response_to == request_id => {}
            Some(_) => return Err(failed("assertion answers a different request")),
            None => return Err(failed("assertion is missing in_response_to")),
        }

        let principal = self.map_principal(&claims)?;
        info!(user_id = %principal.id, "Federated login verified");
        Ok(principal)
    }

    fn logout_url(&self) -> Option<String> {
        self.slo_url.as_ref().map(|url| url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AssertionAlgorithm, session::Session, test_utils::create_test_state};
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use serde_json::json;

    const SECRET: &str = "idp-shared-secret-for-tests";
    const CALLBACK: &str = "https://bff.example.com/api/auth/callback";

    fn config() -> FederatedAuthConfig {
        FederatedAuthConfig {
            entity_id: "portcullis".to_string(),
            idp_sso_url: Some(Url::parse("https://idp.example.com/sso").unwrap()),
            idp_slo_url: Some(Url::parse("https://idp.example.com/slo").unwrap()),
            idp_issuer: "https://idp.example.com".to_string(),
            idp_shared_secret: Some(SECRET.to_string()),
            algorithm: AssertionAlgorithm::HS256,
            attributes: AttributeMapping {
                email: "mail".to_string(),
                roles: "groups".to_string(),
                ..Default::default()
            },
            default_role: Some("viewer".to_string()),
            ..Default::default()
        }
    }

    fn driver() -> FederatedDriver {
        FederatedDriver::new(&config(), CALLBACK, Arc::new(Signer::new("process-secret"))).unwrap()
    }

    fn query_param(url: &str, name: &str) -> String {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    fn assertion(extra: Value) -> String {
        let now = Utc::now().timestamp();
        let mut claims = json!({
            "iss": "https://idp.example.com",
            "aud": "portcullis",
            "nbf": now - 5,
            "exp": now + 300,
            "sub": "idp-user-42",
            "mail": "grace@example.com",
        });
        for (k, v) in extra.as_object().unwrap() {
            claims[k] = v.clone();
        }
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    /// Run login and build the IdP's answer to it
    fn ceremony(driver: &FederatedDriver, extra: Value) -> AuthContext {
        let login_url = driver.login(&AuthContext::default()).unwrap();
        let relay_state = query_param(&login_url, RELAY_STATE);
        let request_id = driver
            .check_relay_state(&relay_state, Utc::now().timestamp_millis())
            .unwrap();

        let mut extra = extra;
        if extra.get("in_response_to").is_none() {
            extra["in_response_to"] = json!(request_id);
        }
        AuthContext {
            query: HashMap::new(),
            form: HashMap::from([
                (SAML_RESPONSE.to_string(), assertion(extra)),
                (RELAY_STATE.to_string(), relay_state),
            ]),
        }
    }

    #[test]
    fn test_login_redirects_to_idp_with_request_and_relay_state() {
        let driver = driver();
        let url = driver.login(&AuthContext::default()).unwrap();
        assert!(url.starts_with("https://idp.example.com/sso?"));

        let request = String::from_utf8(BASE64_STANDARD.decode(query_param(&url, SAML_REQUEST)).unwrap()).unwrap();
        assert!(request.contains(r#"AssertionConsumerServiceURL="https://bff.example.com/api/auth/callback""#));
        assert!(request.contains("<saml:Issuer>portcullis</saml:Issuer>"));

        let relay_state = query_param(&url, RELAY_STATE);
        let request_id = driver
            .check_relay_state(&relay_state, Utc::now().timestamp_millis())
            .unwrap();
        assert!(request.contains(&format!(r#"ID="{request_id}""#)));
    }

    #[tokio::test]
    async fn test_callback_maps_attributes() {
        let driver = driver();
        let ctx = ceremony(
            &driver,
            json!({
                "given_name": "Grace",
                "family_name": "Hopper",
                "groups": ["admin", "user"],
                "department": "Navy",
                "clearance": 5,
                "tags": ["a", "b"],
            }),
        );

        let principal = driver.verify_callback(&ctx).await.unwrap();
        assert_eq!(principal.id, "idp-user-42");
        assert_eq!(principal.email, "grace@example.com");
        assert_eq!(principal.name, "Grace Hopper");
        assert_eq!(principal.roles(), ["admin", "user"]);

        let attributes = principal.attributes.unwrap();
        assert_eq!(attributes["department"], AttributeValue::String("Navy".to_string()));
        assert!(attributes.contains_key("clearance"));
        assert!(!attributes.contains_key("tags"));
        assert!(!attributes.contains_key("iss"));
        assert!(!attributes.contains_key("mail"));
    }

    #[tokio::test]
    async fn test_callback_applies_default_role_and_name_fallback() {
        let driver = driver();
        let principal = driver.verify_callback(&ceremony(&driver, json!({}))).await.unwrap();
        assert_eq!(principal.roles(), ["viewer"]);
        assert_eq!(principal.name, "grace@example.com");

        let principal = driver
            .verify_callback(&ceremony(&driver, json!({ "groups": "editor, user", "name": "Rear Admiral" })))
            .await
            .unwrap();
        assert_eq!(principal.roles(), ["editor", "user"]);
        assert_eq!(principal.name, "Rear Admiral");
    }

    #[tokio::test]
    async fn test_callback_rejects_forged_assertion() {
        let driver = driver();
        let mut ctx = ceremony(&driver, json!({}));
        let now = Utc::now().timestamp();
        let forged = encode(
            &Header::new(Algorithm::HS256),
            &json!({ "iss": "https://idp.example.com", "aud": "portcullis", "exp": now + 300, "sub": "x", "mail": "x@x" }),
            &EncodingKey::from_secret(b"attacker"),
        )
        .unwrap();
        ctx.form.insert(SAML_RESPONSE.to_string(), forged);

        let err = driver.verify_callback(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn test_callback_rejects_missing_identity_attributes() {
        let driver = driver();
        let ctx = ceremony(&driver, json!({ "mail": null }));
        let err = driver.verify_callback(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("'mail'"));
    }

    #[tokio::test]
    async fn test_callback_rejects_bad_relay_state() {
        let driver = driver();

        let mut ctx = ceremony(&driver, json!({}));
        ctx.form.remove(RELAY_STATE);
        assert!(driver.verify_callback(&ctx).await.is_err());

        let mut ctx = ceremony(&driver, json!({}));
        let relay = ctx.form[RELAY_STATE].replacen('_', "-", 1);
        ctx.form.insert(RELAY_STATE.to_string(), relay);
        assert!(driver.verify_callback(&ctx).await.is_err());

        // A relay state minted by another process secret
        let other = FederatedDriver::new(&config(), CALLBACK, Arc::new(Signer::new("other-secret"))).unwrap();
        let ctx = ceremony(&other, json!({}));
        assert!(driver.verify_callback(&ctx).await.is_err());
    }

    #[test]
    fn test_relay_state_expires() {
        let driver = driver();
        let issued_at = Utc::now().timestamp_millis();
        let relay = driver.relay_state("_req", issued_at);

        assert_eq!(driver.check_relay_state(&relay, issued_at + 1_000).unwrap(), "_req");
        let too_late = issued_at + 11 * 60 * 1_000;
        assert!(driver.check_relay_state(&relay, too_late).is_err());
    }

    #[tokio::test]
    async fn test_callback_rejects_answer_to_other_request() {
        let driver = driver();
        let ctx = ceremony(&driver, json!({ "in_response_to": "_someone-elses-request" }));
        let err = driver.verify_callback(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("different request"));
    }

    #[tokio::test]
    async fn test_callback_rejects_unsolicited_assertion() {
        let driver = driver();
        let ctx = ceremony(&driver, json!({ "in_response_to": null }));
        let err = driver.verify_callback(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed { .. }));
        assert!(err.to_string().contains("missing in_response_to"));
    }

    #[tokio::test]
    async fn test_failed_callback_leaves_session_anonymous() {
        let (state, _) = create_test_state();
        let session = Session::new(state.sessions.clone());
        let driver = driver();
        let mut ctx = ceremony(&driver, json!({}));
        ctx.form.insert(SAML_RESPONSE.to_string(), "garbage".to_string());

        assert!(driver.callback(&ctx, &session).await.is_err());
        assert!(session.raw_user().is_none());
    }

    #[tokio::test]
    async fn test_successful_callback_writes_session_and_logout_returns_slo() {
        let (state, _) = create_test_state();
        let session = Session::new(state.sessions.clone());
        let driver = driver();

        let principal = driver.callback(&ceremony(&driver, json!({})), &session).await.unwrap();
        assert_eq!(driver.get_user(&session), Some(principal));

        let redirect = driver.logout(&session).await.unwrap();
        assert_eq!(redirect.as_deref(), Some("https://idp.example.com/slo"));
        assert!(session.is_destroyed());
        assert!(driver.get_user(&session).is_none());
    }

    #[test]
    fn test_missing_sso_url_is_configuration_error() {
        let config = FederatedAuthConfig {
            idp_sso_url: None,
            ..config()
        };
        let err = FederatedDriver::new(&config, CALLBACK, Arc::new(Signer::new("k"))).err().unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
