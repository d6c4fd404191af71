// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Registry Keychain
//!
//! Resolves the credential to present to an image registry. The default
//! [`DockerConfigKeychain`] reads the credential files written by the local
//! container tooling (`docker login`, `podman login`):
//!
//! 1. an explicit file passed by the caller, if any
//! 2. `$DOCKER_CONFIG/config.json`
//! 3. `~/.docker/config.json`
//! 4. `$REGISTRY_AUTH_FILE`
//! 5. `$XDG_RUNTIME_DIR/containers/auth.json`
//! 6. `~/.config/containers/auth.json`
//!
//! The first file holding an entry for the registry wins. Credential helpers
//! (`credsStore`, `credHelpers`) are not executed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::domain::image::DOCKER_HUB_REGISTRY;

/// Credential presented to a registry.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credential {
    #[default]
    Anonymous,
    Basic { username: String, password: String },
    /// OAuth2 refresh token exchanged at the token realm.
    IdentityToken(String),
    /// Bearer token sent to the registry as-is.
    RegistryToken(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::IdentityToken(_) => f.write_str("IdentityToken(<redacted>)"),
            Self::RegistryToken(_) => f.write_str("RegistryToken(<redacted>)"),
        }
    }
}

/// Source of registry credentials.
pub trait Keychain: Send + Sync {
    /// Credential for `registry` (a host such as `ghcr.io` or `docker.io`).
    fn resolve(&self, registry: &str) -> Credential;
}

/// Always anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousKeychain;

impl Keychain for AnonymousKeychain {
    fn resolve(&self, _registry: &str) -> Credential {
        Credential::Anonymous
    }
}

/// Fixed credentials supplied by the caller, keyed by registry host.
#[derive(Debug, Clone, Default)]
pub struct StaticKeychain {
    credentials: HashMap<String, Credential>,
}

impl StaticKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, registry: &str, credential: Credential) -> Self {
        self.credentials.insert(normalize_registry(registry), credential);
        self
    }
}

impl Keychain for StaticKeychain {
    fn resolve(&self, registry: &str) -> Credential {
        self.credentials
            .get(&normalize_registry(registry))
            .cloned()
            .unwrap_or_default()
    }
}

/// Reads `auths` from Docker / Podman credential files.
#[derive(Debug, Clone)]
pub struct DockerConfigKeychain {
    paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct AuthFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
    #[serde(default)]
    registrytoken: Option<String>,
}

impl DockerConfigKeychain {
    /// Keychain over the well-known credential locations.
    pub fn discover() -> Self {
        Self::with_explicit(None)
    }

    /// Keychain consulting `explicit` first, then the well-known locations.
    pub fn with_explicit(explicit: Option<PathBuf>) -> Self {
        let mut paths = Vec::new();
        if let Some(path) = explicit {
            paths.push(path);
        }
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            paths.push(PathBuf::from(dir).join("config.json"));
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".docker").join("config.json"));
        }
        if let Some(file) = std::env::var_os("REGISTRY_AUTH_FILE") {
            paths.push(PathBuf::from(file));
        }
        if let Some(runtime) = std::env::var_os("XDG_RUNTIME_DIR") {
            paths.push(PathBuf::from(runtime).join("containers").join("auth.json"));
        }
        if let Some(config) = dirs::config_dir() {
            paths.push(config.join("containers").join("auth.json"));
        }
        Self { paths }
    }

    /// Keychain over exactly these files, in order.
    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn read_file(path: &Path) -> Option<AuthFile> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Cannot read registry credential file");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring malformed registry credential file");
                None
            }
        }
    }
}

impl Keychain for DockerConfigKeychain {
    fn resolve(&self, registry: &str) -> Credential {
        let wanted = normalize_registry(registry);
        for path in &self.paths {
            let Some(file) = Self::read_file(path) else {
                continue;
            };
            let entry = file
                .auths
                .iter()
                .find(|(key, _)| normalize_registry(key) == wanted)
                .map(|(_, entry)| entry);
            if let Some(entry) = entry {
                match entry_credential(entry) {
                    Some(credential) => {
                        debug!(registry = %wanted, path = %path.display(), "Resolved registry credential");
                        return credential;
                    }
                    None => warn!(
                        registry = %wanted,
                        path = %path.display(),
                        "Registry credential entry has no usable secret"
                    ),
                }
            }
        }
        debug!(registry = %wanted, "No registry credential found, using anonymous access");
        Credential::Anonymous
    }
}

fn entry_credential(entry: &AuthEntry) -> Option<Credential> {
    if let Some(token) = entry.registrytoken.as_ref().filter(|t| !t.is_empty()) {
        return Some(Credential::RegistryToken(token.clone()));
    }
    if let Some(token) = entry.identitytoken.as_ref().filter(|t| !t.is_empty()) {
        return Some(Credential::IdentityToken(token.clone()));
    }
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        if !username.is_empty() {
            return Some(Credential::Basic {
                username: username.clone(),
                password: password.clone(),
            });
        }
    }
    let encoded = entry.auth.as_ref().filter(|a| !a.is_empty())?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credential::Basic {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Reduce a credential-file key or registry host to a comparable host name.
/// All Docker Hub aliases collapse to `docker.io`.
pub fn normalize_registry(key: &str) -> String {
    let without_scheme = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    match host {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" | "docker.io" => {
            DOCKER_HUB_REGISTRY.to_string()
        }
        other => other.to_ascii_lowercase(),
    }
}
