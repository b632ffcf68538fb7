//! The authenticated principal derived from a bearer token.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// A single claim value as it arrives in a token.
///
/// JWT claims are heterogeneous: the same claim name can carry a string in
/// one realm and a list of strings in another, and providers are free to nest
/// arbitrary structures. Downstream checks match on this variant instead of
/// poking at raw JSON.
#[derive(Clone, Debug, PartialEq)]
pub enum ClaimValue {
    String(String),
    Strings(Vec<String>),
    Other(Value),
}

impl From<&Value> for ClaimValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => ClaimValue::String(s.clone()),
            Value::Array(items) => {
                let mut strings = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => strings.push(s.clone()),
                        _ => return ClaimValue::Other(value.clone()),
                    }
                }
                ClaimValue::Strings(strings)
            }
            other => ClaimValue::Other(other.clone()),
        }
    }
}

impl ClaimValue {
    /// Renders the claim for an upstream header. Lists join with commas in
    /// the order the token carries them.
    pub fn as_header_value(&self) -> String {
        match self {
            ClaimValue::String(s) => s.clone(),
            ClaimValue::Strings(items) => items.join(","),
            ClaimValue::Other(raw) => raw.to_string(),
        }
    }
}

/// The verified principal attached to the request scope by the
/// authentication filter.
#[derive(Clone, Debug)]
pub struct Identity {
    /// Subject identifier (`sub`).
    pub id: String,
    /// Preferred username, falling back to the subject.
    pub username: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
    /// The encoded token exactly as presented. Updated in place on refresh.
    pub raw_token: String,
    pub audiences: Vec<String>,
    /// Realm roles plus client roles in `client:role` form.
    pub roles: Vec<String>,
    pub groups: Vec<String>,
    /// The provider-specific `authorization` claim, passed through opaquely
    /// to the authorization filter.
    pub permissions: Option<Value>,
    /// Every claim in the token, for claim-match admission rules and custom
    /// header mappings.
    pub claims: HashMap<String, ClaimValue>,
}

impl Identity {
    /// Builds an identity from decoded (but not yet verified) token claims.
    pub fn from_claims(raw_token: String, claims: &Value) -> anyhow::Result<Self> {
        let object = claims
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("token claims are not an object"))?;

        let id = object
            .get("sub")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("token has no subject claim"))?
            .to_string();

        let exp = object
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("token has no expiration claim"))?;
        let expires_at = match Utc.timestamp_opt(exp, 0) {
            chrono::LocalResult::Single(at) => at,
            _ => return Err(anyhow::anyhow!("token expiration is out of range")),
        };

        let username = object
            .get("preferred_username")
            .and_then(Value::as_str)
            .unwrap_or(&id)
            .to_string();

        let email = object
            .get("email")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let audiences = match object.get("aud") {
            Some(Value::String(aud)) => vec![aud.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        let mut roles = roles_of(object.get("realm_access"));
        if let Some(Value::Object(clients)) = object.get("resource_access") {
            for (client, access) in clients {
                for role in roles_of(Some(access)) {
                    roles.push(format!("{client}:{role}"));
                }
            }
        }

        let groups = object
            .get("groups")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let claims = object
            .iter()
            .map(|(name, value)| (name.clone(), ClaimValue::from(value)))
            .collect();

        Ok(Self {
            id,
            username,
            email,
            expires_at,
            raw_token,
            audiences,
            roles,
            groups,
            permissions: object.get("authorization").cloned(),
            claims,
        })
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

fn roles_of(access: Option<&Value>) -> Vec<String> {
    access
        .and_then(|value| value.get("roles"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims() -> Value {
        json!({
            "sub": "user-123",
            "preferred_username": "alice",
            "email": "alice@example.com",
            "exp": 32503680000i64,
            "aud": ["console", "account"],
            "realm_access": {"roles": ["user"]},
            "resource_access": {"console": {"roles": ["admin"]}},
            "groups": ["/engineering"],
            "authorization": {"permissions": [{"rsid": "res-1"}]},
            "department": "engineering"
        })
    }

    #[test]
    fn test_from_claims() {
        let identity = Identity::from_claims("raw".to_string(), &claims()).unwrap();

        assert_eq!(identity.id, "user-123");
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.email, "alice@example.com");
        assert_eq!(identity.audiences, vec!["console", "account"]);
        assert_eq!(identity.roles, vec!["user", "console:admin"]);
        assert_eq!(identity.groups, vec!["/engineering"]);
        assert!(identity.permissions.is_some());
        assert!(!identity.is_expired());
        assert_eq!(
            identity.claims.get("department"),
            Some(&ClaimValue::String("engineering".to_string()))
        );
    }

    #[test]
    fn test_from_claims_minimal() {
        let identity =
            Identity::from_claims("raw".to_string(), &json!({"sub": "svc", "exp": 0})).unwrap();

        assert_eq!(identity.username, "svc");
        assert_eq!(identity.email, "");
        assert!(identity.audiences.is_empty());
        assert!(identity.is_expired());
    }

    #[test]
    fn test_from_claims_requires_subject_and_expiry() {
        assert!(Identity::from_claims("raw".to_string(), &json!({"exp": 0})).is_err());
        assert!(Identity::from_claims("raw".to_string(), &json!({"sub": "x"})).is_err());
        assert!(Identity::from_claims("raw".to_string(), &json!("not-an-object")).is_err());
    }

    #[test]
    fn test_single_audience_string() {
        let identity =
            Identity::from_claims("raw".into(), &json!({"sub": "x", "exp": 0, "aud": "console"}))
                .unwrap();
        assert_eq!(identity.audiences, vec!["console"]);
    }

    #[test]
    fn test_claim_value_variants() {
        assert_eq!(
            ClaimValue::from(&json!("one")),
            ClaimValue::String("one".to_string())
        );
        assert_eq!(
            ClaimValue::from(&json!(["a", "b"])),
            ClaimValue::Strings(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            ClaimValue::from(&json!(["a", 1])),
            ClaimValue::Other(json!(["a", 1]))
        );
        assert_eq!(ClaimValue::from(&json!(42)), ClaimValue::Other(json!(42)));
    }

    #[test]
    fn test_claim_header_rendering() {
        assert_eq!(
            ClaimValue::Strings(vec!["a".into(), "b".into()]).as_header_value(),
            "a,b"
        );
        assert_eq!(ClaimValue::String("x".into()).as_header_value(), "x");
    }
}
