//! The authenticated principal and its session codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use utoipa::ToSchema;

/// Scalar attribute value carried alongside a principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Null,
}

/// The validated identity of the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Principal {
    /// Provider-issued unique identifier
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<HashMap<String, Object>>)]
    pub attributes: Option<HashMap<String, AttributeValue>>,
}

impl Principal {
    pub fn new(id: impl Into<String>, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            name: name.into(),
            roles: None,
            attributes: None,
        }
    }

    pub fn with_roles<I, R>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        self.roles = Some(roles.into_iter().map(Into::into).collect());
        self
    }

    pub fn roles(&self) -> &[String] {
        self.roles.as_deref().unwrap_or_default()
    }

    /// True iff the principal holds at least one of `roles` (exact, case-sensitive match).
    pub fn has_any_role<R: AsRef<str>>(&self, roles: &[R]) -> bool {
        let held = self.roles();
        roles.iter().any(|wanted| held.iter().any(|r| r == wanted.as_ref()))
    }

    fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.email.is_empty() && !self.name.is_empty()
    }
}

/// Validate a raw session value as a principal.
///
/// Missing or empty identity fields, wrong types, non-string roles and nested attribute values
/// all yield `None`. Never panics.
pub fn decode(raw: &Value) -> Option<Principal> {
    Principal::deserialize(raw).ok().filter(Principal::is_complete)
}

/// Encode a principal for storage in the session.
pub fn encode(principal: &Principal) -> Value {
    // Serializing plain strings, maps and scalars cannot fail
    serde_json::to_value(principal).unwrap_or(Value::Null)
}
