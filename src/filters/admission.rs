//! Admission filter: per-resource role, group, and claim checks.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use regex::Regex;
use tracing::{debug, error, warn};

use super::{access_forbidden, request_scope};
use crate::config::Resource;
use crate::identity::{ClaimValue, Identity};

/// One admission policy per protected resource, with the claim-match rules
/// compiled once at construction.
pub struct AdmissionPolicy {
    resource: Resource,
    claim_matches: HashMap<String, Regex>,
}

impl AdmissionPolicy {
    pub fn new(
        resource: Resource,
        match_claims: &HashMap<String, String>,
    ) -> Result<Self, regex::Error> {
        let mut claim_matches = HashMap::new();
        for (claim, pattern) in match_claims {
            claim_matches.insert(claim.clone(), Regex::new(pattern)?);
        }

        Ok(Self {
            resource,
            claim_matches,
        })
    }
}

pub async fn admission(
    State(policy): State<Arc<AdmissionPolicy>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(scope) = request_scope(&req) else {
        return next.run(req).await;
    };

    // we don't need to continue if a decision has been made
    if scope.is_denied() {
        return next.run(req).await;
    }
    let Some(user) = scope.identity() else {
        return next.run(req).await;
    };

    let resource = &policy.resource;

    if !has_access(&resource.roles, &user.roles, !resource.require_any_role) {
        warn!(
            access = "denied",
            email = %user.email,
            resource = %resource.url,
            roles = %resource.roles.join(","),
            "access denied, invalid roles"
        );
        return access_forbidden(&scope);
    }

    if !has_access(&resource.groups, &user.groups, false) {
        warn!(
            access = "denied",
            email = %user.email,
            resource = %resource.url,
            groups = %resource.groups.join(","),
            "access denied, invalid groups"
        );
        return access_forbidden(&scope);
    }

    for (claim, matcher) in &policy.claim_matches {
        if !check_claim(&user, claim, matcher, &resource.url) {
            return access_forbidden(&scope);
        }
    }

    debug!(
        access = "permitted",
        email = %user.email,
        resource = %resource.url,
        "access permitted to resource"
    );

    next.run(req).await
}

/// Whether `actual` satisfies `required`: vacuously true for an empty
/// requirement, all entries when `require_all`, any single entry otherwise.
pub fn has_access(required: &[String], actual: &[String], require_all: bool) -> bool {
    if required.is_empty() {
        return true;
    }

    if require_all {
        required.iter().all(|entry| actual.contains(entry))
    } else {
        required.iter().any(|entry| actual.contains(entry))
    }
}

/// Whether the named claim exists and matches. A string claim is tested
/// directly, a list of strings succeeds on the first matching element, and
/// anything else denies.
fn check_claim(user: &Identity, claim: &str, matcher: &Regex, resource_url: &str) -> bool {
    let Some(value) = user.claims.get(claim) else {
        warn!(
            claim,
            access = "denied",
            email = %user.email,
            resource = %resource_url,
            "the token does not have the claim"
        );
        return false;
    };

    match value {
        ClaimValue::String(issued) => {
            if matcher.is_match(issued) {
                return true;
            }
            warn!(
                claim,
                access = "denied",
                email = %user.email,
                resource = %resource_url,
                issued = %issued,
                required = %matcher.as_str(),
                "claim requirement does not match claim in token"
            );
            false
        }
        ClaimValue::Strings(issued) => {
            if issued.iter().any(|value| matcher.is_match(value)) {
                return true;
            }
            warn!(
                claim,
                access = "denied",
                email = %user.email,
                resource = %resource_url,
                issued = %issued.join(","),
                required = %matcher.as_str(),
                "claim requirement does not match any element claim group in token"
            );
            false
        }
        ClaimValue::Other(issued) => {
            error!(
                claim,
                issued = %issued,
                "unable to extract the claim from token, not a string or array of strings"
            );
            false
        }
    }
}
