//! Cookie handling: baking, clearing, filtering, and token encryption.

use std::time::Duration;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use axum::http::{HeaderMap, HeaderValue, header};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};

use crate::config::Settings;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM cipher for cookie-borne tokens. The encoded form is a random
/// nonce prefixed to the ciphertext, URL-safe base64 without padding.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// The key must be exactly 32 bytes.
    pub fn new(key: &str) -> anyhow::Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| anyhow::anyhow!("encryption key must be exactly 32 bytes"))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("failed to encrypt token"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> anyhow::Result<String> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| anyhow::anyhow!("encrypted token is not valid base64"))?;

        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(anyhow::anyhow!("encrypted token is truncated"));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("failed to decrypt token"))?;

        Ok(String::from_utf8(plaintext)?)
    }
}

/// Reads a cookie value from the request headers.
pub fn get_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=')
                && key == name
            {
                return Some(value.to_string());
            }
        }
    }
    None
}

pub fn access_token_cookie(
    config: &Settings,
    value: &str,
    max_age: Duration,
) -> anyhow::Result<HeaderValue> {
    bake_cookie(config, &config.cookie_access_name, value, Some(max_age))
}

pub fn refresh_token_cookie(
    config: &Settings,
    value: &str,
    max_age: Duration,
) -> anyhow::Result<HeaderValue> {
    bake_cookie(config, &config.cookie_refresh_name, value, Some(max_age))
}

/// Expires both token cookies on the response.
pub fn clear_all_cookies(config: &Settings, headers: &mut HeaderMap) {
    for name in [&config.cookie_access_name, &config.cookie_refresh_name] {
        if let Ok(cookie) = bake_cookie(config, name, "", Some(Duration::ZERO)) {
            headers.append(header::SET_COOKIE, cookie);
        }
    }
}

/// Removes the named cookies from the forwarded `Cookie` header, leaving the
/// rest for the upstream.
pub fn filter_cookies(headers: &mut HeaderMap, names: &[&str]) {
    let mut kept: Vec<String> = Vec::new();

    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let name = pair.split_once('=').map(|(name, _)| name).unwrap_or(pair);
            if !names.contains(&name) {
                kept.push(pair.to_string());
            }
        }
    }

    headers.remove(header::COOKIE);
    if !kept.is_empty()
        && let Ok(value) = HeaderValue::from_str(&kept.join("; "))
    {
        headers.insert(header::COOKIE, value);
    }
}

fn bake_cookie(
    config: &Settings,
    name: &str,
    value: &str,
    max_age: Option<Duration>,
) -> anyhow::Result<HeaderValue> {
    let mut cookie = format!("{name}={value}; Path=/");

    if let Some(domain) = &config.cookie_domain {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    if let Some(max_age) = max_age {
        cookie.push_str("; Max-Age=");
        cookie.push_str(&max_age.as_secs().to_string());
    }
    if config.http_only_cookie {
        cookie.push_str("; HttpOnly");
    }
    if config.secure_cookie {
        cookie.push_str("; Secure");
    }
    cookie.push_str("; SameSite=");
    cookie.push_str(&config.same_site_cookie);

    HeaderValue::from_str(&cookie).map_err(|_| anyhow::anyhow!("cookie value is not a valid header"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn test_encrypt_round_trip() {
        let cipher = TokenCipher::new("0123456789abcdef0123456789abcdef").unwrap();

        let encoded = cipher.encrypt("a-refresh-token").unwrap();
        assert_ne!(encoded, "a-refresh-token");
        assert_eq!(cipher.decrypt(&encoded).unwrap(), "a-refresh-token");

        // a fresh nonce every time
        let again = cipher.encrypt("a-refresh-token").unwrap();
        assert_ne!(encoded, again);
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        let cipher = TokenCipher::new("0123456789abcdef0123456789abcdef").unwrap();

        assert!(cipher.decrypt("not base64 !!").is_err());
        assert!(cipher.decrypt("c2hvcnQ").is_err());

        let other = TokenCipher::new("fedcba9876543210fedcba9876543210").unwrap();
        let encoded = other.encrypt("secret").unwrap();
        assert!(cipher.decrypt(&encoded).is_err());
    }

    #[test]
    fn test_cipher_requires_32_byte_key() {
        assert!(TokenCipher::new("too-short").is_err());
        assert!(TokenCipher::new("0123456789abcdef0123456789abcdef").is_ok());
    }

    #[test]
    fn test_get_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("kc-access=token-a; other=b"),
        );

        assert_eq!(get_cookie(&headers, "kc-access").unwrap(), "token-a");
        assert_eq!(get_cookie(&headers, "other").unwrap(), "b");
        assert!(get_cookie(&headers, "missing").is_none());
    }

    #[test]
    fn test_access_cookie_attributes() {
        let mut config = settings();
        config.cookie_domain = Some("example.com".to_string());
        config.secure_cookie = true;

        let cookie = access_token_cookie(&config, "value", Duration::from_secs(300)).unwrap();
        let cookie = cookie.to_str().unwrap();

        assert!(cookie.starts_with("kc-access=value; Path=/"));
        assert!(cookie.contains("Domain=example.com"));
        assert!(cookie.contains("Max-Age=300"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=Lax"));
    }

    #[test]
    fn test_clear_all_cookies() {
        let config = settings();
        let mut headers = HeaderMap::new();

        clear_all_cookies(&config, &mut headers);

        let cookies: Vec<_> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].starts_with("kc-access=; "));
        assert!(cookies[1].starts_with("kc-state=; "));
        assert!(cookies.iter().all(|c| c.contains("Max-Age=0")));
    }

    #[test]
    fn test_filter_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("kc-access=a; session=s; kc-state=r"),
        );

        filter_cookies(&mut headers, &["kc-access", "kc-state"]);

        assert_eq!(headers.get(header::COOKIE).unwrap(), "session=s");
    }

    #[test]
    fn test_filter_cookies_removes_empty_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("kc-access=a"));

        filter_cookies(&mut headers, &["kc-access"]);

        assert!(headers.get(header::COOKIE).is_none());
    }
}
