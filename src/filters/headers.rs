//! Identity headers toward the upstream.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use super::request_scope;
use crate::cookies;
use crate::proxy::ProxyState;

/// Injects the `X-Auth-*` headers derived from the identity, optionally the
/// raw token and a bearer Authorization header, strips the token cookies
/// from the forwarded request, and maps any configured custom claims.
pub async fn identity_headers(
    State(state): State<ProxyState>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(user) = request_scope(&req).and_then(|scope| scope.identity()) {
        let config = &state.config;
        let headers = req.headers_mut();

        set_header(
            headers,
            HeaderName::from_static("x-auth-audience"),
            &user.audiences.join(","),
        );
        set_header(headers, HeaderName::from_static("x-auth-email"), &user.email);
        set_header(
            headers,
            HeaderName::from_static("x-auth-expiresin"),
            &user.expires_at.to_rfc3339(),
        );
        set_header(
            headers,
            HeaderName::from_static("x-auth-groups"),
            &user.groups.join(","),
        );
        set_header(
            headers,
            HeaderName::from_static("x-auth-roles"),
            &user.roles.join(","),
        );
        set_header(headers, HeaderName::from_static("x-auth-subject"), &user.id);
        set_header(
            headers,
            HeaderName::from_static("x-auth-userid"),
            &user.username,
        );
        set_header(
            headers,
            HeaderName::from_static("x-auth-username"),
            &user.username,
        );

        if config.enable_token_header {
            set_header(
                headers,
                HeaderName::from_static("x-auth-token"),
                &user.raw_token,
            );
        }
        if config.enable_authorization_header {
            set_header(
                headers,
                header::AUTHORIZATION,
                &format!("Bearer {}", user.raw_token),
            );
        }
        if !config.enable_authorization_cookies {
            cookies::filter_cookies(
                headers,
                &[
                    config.cookie_access_name.as_str(),
                    config.cookie_refresh_name.as_str(),
                ],
            );
        }

        for (claim, header_name) in state.claim_headers.iter() {
            if let Some(value) = user.claims.get(claim) {
                set_header(headers, header_name.clone(), &value.as_header_value());
            }
        }
    }

    next.run(req).await
}

fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "identity value is not a valid header, skipping"),
    }
}

/// Parses the configured custom-claim entries. `claim|Header-Name` maps the
/// claim to that header; a bare `claim` defaults to `X-Auth-<Title-Cased>`.
pub(crate) fn claim_header_mappings(
    entries: &[String],
) -> anyhow::Result<Vec<(String, HeaderName)>> {
    let mut mappings = Vec::with_capacity(entries.len());

    for entry in entries {
        let (claim, header) = match entry.split_once('|') {
            Some((claim, header)) => (claim.to_string(), title_case(header)),
            None => (entry.clone(), format!("X-Auth-{}", title_case(entry))),
        };
        let name = HeaderName::from_bytes(header.as_bytes())
            .map_err(|_| anyhow::anyhow!("invalid claim header name: {}", header))?;
        mappings.push((claim, name));
    }

    Ok(mappings)
}

fn title_case(name: &str) -> String {
    name.split(['_', '-'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("given_name"), "Given-Name");
        assert_eq!(title_case("department"), "Department");
        assert_eq!(title_case("x-forwarded-user"), "X-Forwarded-User");
    }

    #[test]
    fn test_claim_header_mappings_default_prefix() {
        let mappings = claim_header_mappings(&["given_name".to_string()]).unwrap();

        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].0, "given_name");
        assert_eq!(mappings[0].1.as_str(), "x-auth-given-name");
    }

    #[test]
    fn test_claim_header_mappings_explicit_header() {
        let mappings = claim_header_mappings(&["department|X-Department".to_string()]).unwrap();

        assert_eq!(mappings[0].0, "department");
        assert_eq!(mappings[0].1.as_str(), "x-department");
    }

    #[test]
    fn test_claim_header_mappings_invalid_header() {
        assert!(claim_header_mappings(&["department|bad header".to_string()]).is_err());
    }
}
