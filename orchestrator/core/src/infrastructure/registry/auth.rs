// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Registry token authentication.
//!
//! Implements the distribution token flow: a `401` carrying
//! `WWW-Authenticate: Bearer realm=…,service=…,scope=…` is answered by asking
//! the realm for a bearer token, which is then cached per registry and scope
//! until it expires.

use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::error_chain;
use crate::domain::registry::ImageLookupError;
use crate::infrastructure::keychain::Credential;

/// Lifetime assumed for tokens that state none, and the floor for those that do.
const MIN_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

/// Tokens are dropped this long before the realm says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(5);

const CLIENT_ID: &str = "reconcile-gate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Bearer,
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: AuthScheme,
    params: HashMap<String, String>,
}

impl Challenge {
    /// Parse a `Basic` or `Bearer` challenge; other schemes yield `None`.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) => (scheme, rest),
            None => (header, ""),
        };
        let scheme = if scheme.eq_ignore_ascii_case("bearer") {
            AuthScheme::Bearer
        } else if scheme.eq_ignore_ascii_case("basic") {
            AuthScheme::Basic
        } else {
            return None;
        };
        Some(Self {
            scheme,
            params: parse_params(rest),
        })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Parse `key=value` and `key="quoted, value"` pairs separated by commas.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() && chars.peek().is_none() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => break,
                        other => value.push(other),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }
        let key = key.trim().to_ascii_lowercase();
        if !key.is_empty() {
            params.insert(key, value.trim().to_string());
        }
        if chars.peek().is_none() {
            break;
        }
    }

    params
}

/// Bearer tokens keyed by `host|scope`.
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: DashMap<String, (String, Instant)>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.tokens.get(key) {
            if entry.1 > now {
                return Some(entry.0.clone());
            }
        }
        self.tokens.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        None
    }

    pub fn insert(&self, key: String, token: String, lifetime: Duration) {
        let lifetime = lifetime.max(MIN_TOKEN_LIFETIME).saturating_sub(EXPIRY_MARGIN);
        self.tokens.insert(key, (token, Instant::now() + lifetime));
    }

    pub fn invalidate(&self, key: &str) {
        self.tokens.remove(key);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// A token issued by a realm.
#[derive(Debug, Clone)]
pub struct BearerToken {
    pub value: String,
    pub lifetime: Duration,
}

/// Exchange `credential` for a bearer token at the challenge's realm.
pub async fn fetch_token(
    http: &reqwest::Client,
    registry: &str,
    challenge: &Challenge,
    default_scope: &str,
    credential: &Credential,
) -> Result<BearerToken, ImageLookupError> {
    let auth_err = |message: String| ImageLookupError::Authentication {
        registry: registry.to_string(),
        message,
    };

    let realm = challenge
        .param("realm")
        .ok_or_else(|| auth_err("bearer challenge carries no realm".to_string()))?;
    let scope = challenge.param("scope").unwrap_or(default_scope);
    let service = challenge.param("service");

    let request = match credential {
        Credential::IdentityToken(refresh_token) => {
            let mut form = vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", CLIENT_ID),
                ("scope", scope),
            ];
            if let Some(service) = service {
                form.push(("service", service));
            }
            http.post(realm).form(&form)
        }
        other => {
            let mut query = vec![("scope", scope)];
            if let Some(service) = service {
                query.push(("service", service));
            }
            let url = url::Url::parse_with_params(realm, &query)
                .map_err(|e| auth_err(format!("invalid token realm '{}': {}", realm, e)))?;
            let request = http.get(url);
            match other {
                Credential::Basic { username, password } => request.basic_auth(username, Some(password)),
                _ => request,
            }
        }
    };

    debug!(registry = %registry, realm = %realm, scope = %scope, "Requesting registry token");

    let response = request.send().await.map_err(|e| ImageLookupError::Transport {
        registry: registry.to_string(),
        message: error_chain(&e),
    })?;

    let status = response.status();
    if status.is_server_error() {
        return Err(ImageLookupError::RegistryStatus {
            registry: registry.to_string(),
            status: status.as_u16(),
            url: realm.to_string(),
        });
    }
    if !status.is_success() {
        return Err(auth_err(format!("token realm {} answered HTTP {}", realm, status.as_u16())));
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| auth_err(format!("malformed token response: {}", error_chain(&e))))?;

    let value = body
        .token
        .filter(|t| !t.is_empty())
        .or(body.access_token.filter(|t| !t.is_empty()))
        .ok_or_else(|| auth_err("token response carries no token".to_string()))?;

    Ok(BearerToken {
        value,
        lifetime: body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(MIN_TOKEN_LIFETIME),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/python:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.scheme, AuthScheme::Bearer);
        assert_eq!(challenge.param("realm"), Some("https://auth.docker.io/token"));
        assert_eq!(challenge.param("service"), Some("registry.docker.io"));
        assert_eq!(challenge.param("scope"), Some("repository:library/python:pull"));
    }

    #[test]
    fn test_parse_quoted_commas_and_unquoted_values() {
        let challenge =
            Challenge::parse(r#"bearer realm=https://r.example/token, scope="repository:a/b:pull,push", error=invalid_token"#)
                .unwrap();
        assert_eq!(challenge.param("realm"), Some("https://r.example/token"));
        assert_eq!(challenge.param("scope"), Some("repository:a/b:pull,push"));
        assert_eq!(challenge.param("error"), Some("invalid_token"));
    }

    #[test]
    fn test_parse_basic_and_unknown_schemes() {
        let basic = Challenge::parse(r#"Basic realm="Registry Realm""#).unwrap();
        assert_eq!(basic.scheme, AuthScheme::Basic);
        assert_eq!(basic.param("realm"), Some("Registry Realm"));
        assert!(Challenge::parse("Negotiate abc").is_none());
        assert_eq!(Challenge::parse("Bearer").unwrap().param("realm"), None);
    }

    #[test]
    fn test_token_cache_expiry() {
        let cache = TokenCache::new();
        cache.insert("h|s".to_string(), "tok".to_string(), Duration::from_secs(300));
        assert_eq!(cache.get("h|s"), Some("tok".to_string()));
        assert_eq!(cache.get("other"), None);

        cache.tokens.insert("old".to_string(), ("stale".to_string(), Instant::now()));
        assert_eq!(cache.get("old"), None);
        assert_eq!(cache.len(), 1);

        cache.invalidate("h|s");
        assert!(cache.is_empty());
    }
}
