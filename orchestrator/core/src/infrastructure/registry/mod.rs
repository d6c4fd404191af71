// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! OCI Distribution Registry Client
//!
//! Resolves an image reference to its configuration over the distribution
//! HTTP API:
//!
//! ```text
//! GET /v2/{name}/manifests/{reference}   (index → pick platform → manifest)
//! GET /v2/{name}/blobs/{digest}          (config blob)
//! ```
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Production [`ImageConfigSource`] behind the image index
//! - **Integration:** Keychain → token realm → registry → [`ImageConfig`]
//!
//! The client never retries. Every failure is mapped onto
//! [`ImageLookupError`] so the caller can decide from its class.

pub mod auth;
pub mod manifest;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::domain::gate_config::RegistryConfig;
use crate::domain::image::{ImageConfig, ImageReference, Platform};
use crate::domain::registry::{ImageConfigSource, ImageLookupError};
use crate::infrastructure::keychain::{Credential, Keychain};
use crate::infrastructure::telemetry;

use auth::{AuthScheme, Challenge, TokenCache};
use manifest::{Manifest, MAX_CONFIG_BYTES, MAX_MANIFEST_BYTES};

/// Render an error and its sources as `outer: inner: root`.
pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !rendered.contains(&cause_text) {
            rendered.push_str(": ");
            rendered.push_str(&cause_text);
        }
        source = cause.source();
    }
    rendered
}

enum Authorization {
    Bearer(String),
    Basic { username: String, password: String },
}

/// Distribution API client for resolving image configurations.
pub struct RegistryClient {
    http: reqwest::Client,
    keychain: Arc<dyn Keychain>,
    platform: Platform,
    insecure_registries: HashSet<String>,
    tokens: TokenCache,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig, keychain: Arc<dyn Keychain>, platform: Platform) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self::with_http_client(http, config, keychain, platform))
    }

    /// Build around an existing HTTP client (shared connection pools, custom TLS roots).
    pub fn with_http_client(
        http: reqwest::Client,
        config: &RegistryConfig,
        keychain: Arc<dyn Keychain>,
        platform: Platform,
    ) -> Self {
        Self {
            http,
            keychain,
            platform,
            insecure_registries: config
                .insecure_registries
                .iter()
                .map(|r| r.to_ascii_lowercase())
                .collect(),
            tokens: TokenCache::new(),
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    fn base_url(&self, reference: &ImageReference) -> String {
        let host = reference.api_host();
        let scheme = if self.insecure_registries.contains(&host.to_ascii_lowercase()) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, host)
    }

    async fn send(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
        authorization: Option<&Authorization>,
    ) -> Result<Response, ImageLookupError> {
        let mut request = self.http.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        request = match authorization {
            Some(Authorization::Bearer(token)) => request.bearer_auth(token),
            Some(Authorization::Basic { username, password }) => request.basic_auth(username, Some(password)),
            None => request,
        };
        request.send().await.map_err(|e| ImageLookupError::Transport {
            registry: reference.registry().to_string(),
            message: error_chain(&e),
        })
    }

    /// GET `url`, answering one authentication challenge if the registry raises it.
    async fn get(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
    ) -> Result<Response, ImageLookupError> {
        let registry = reference.registry().to_string();
        let scope = reference.pull_scope();
        let token_key = format!("{}|{}", reference.api_host(), scope);
        let credential = self.keychain.resolve(reference.registry());

        let cached = match (&credential, self.tokens.get(&token_key)) {
            (Credential::RegistryToken(token), _) => Some(Authorization::Bearer(token.clone())),
            (_, Some(token)) => Some(Authorization::Bearer(token)),
            _ => None,
        };

        let response = self.send(reference, url, accept, cached.as_ref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        self.tokens.invalidate(&token_key);

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse)
            .ok_or_else(|| ImageLookupError::Authentication {
                registry: registry.clone(),
                message: "registry answered 401 without a supported challenge".to_string(),
            })?;

        let authorization = match challenge.scheme {
            AuthScheme::Bearer => {
                let token = auth::fetch_token(&self.http, &registry, &challenge, &scope, &credential).await?;
                self.tokens.insert(token_key.clone(), token.value.clone(), token.lifetime);
                Authorization::Bearer(token.value)
            }
            AuthScheme::Basic => match &credential {
                Credential::Basic { username, password } => Authorization::Basic {
                    username: username.clone(),
                    password: password.clone(),
                },
                _ => {
                    return Err(ImageLookupError::Authentication {
                        registry,
                        message: "registry requires basic credentials and none are configured".to_string(),
                    })
                }
            },
        };

        debug!(registry = %registry, scope = %scope, "Retrying registry request with credentials");
        let response = self.send(reference, url, accept, Some(&authorization)).await?;
        if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            self.tokens.invalidate(&token_key);
            return Err(ImageLookupError::Authentication {
                registry,
                message: format!("access to {} denied (HTTP {})", scope, response.status().as_u16()),
            });
        }
        Ok(response)
    }

    fn check_status(reference: &ImageReference, url: &str, what: &str, response: &Response) -> Result<(), ImageLookupError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let registry = reference.registry().to_string();
        Err(match status {
            StatusCode::NOT_FOUND => ImageLookupError::NotFound {
                registry,
                what: what.to_string(),
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ImageLookupError::Authentication {
                registry,
                message: format!("access to {} denied (HTTP {})", what, status.as_u16()),
            },
            _ => ImageLookupError::RegistryStatus {
                registry,
                status: status.as_u16(),
                url: url.to_string(),
            },
        })
    }

    async fn read_body(
        reference: &ImageReference,
        what: &str,
        response: Response,
        limit: usize,
    ) -> Result<Vec<u8>, ImageLookupError> {
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(ImageLookupError::Decode {
                what: what.to_string(),
                message: format!("body exceeds {} bytes", limit),
            });
        }
        let body = response.bytes().await.map_err(|e| ImageLookupError::Transport {
            registry: reference.registry().to_string(),
            message: error_chain(&e),
        })?;
        if body.len() > limit {
            return Err(ImageLookupError::Decode {
                what: what.to_string(),
                message: format!("body exceeds {} bytes", limit),
            });
        }
        Ok(body.to_vec())
    }

    /// Fetch and decode the manifest named by `manifest_reference` (tag or digest).
    pub async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        manifest_reference: &str,
    ) -> Result<Manifest, ImageLookupError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference),
            reference.repository(),
            manifest_reference
        );
        let what = format!("manifest {}:{}", reference.repository(), manifest_reference);
        let accept = manifest::manifest_accept_header();

        let response = self.get(reference, &url, Some(&accept)).await?;
        Self::check_status(reference, &url, &what, &response)?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = Self::read_body(reference, &what, response, MAX_MANIFEST_BYTES).await?;

        if manifest_reference.contains(':') {
            manifest::verify_digest(manifest_reference, &body)?;
        }
        manifest::decode_manifest(content_type.as_deref(), &body, &what)
    }

    /// Fetch a blob and verify it against its digest.
    pub async fn fetch_blob(&self, reference: &ImageReference, digest: &str) -> Result<Vec<u8>, ImageLookupError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(reference),
            reference.repository(),
            digest
        );
        let what = format!("blob {}@{}", reference.repository(), digest);

        let response = self.get(reference, &url, None).await?;
        Self::check_status(reference, &url, &what, &response)?;
        let body = Self::read_body(reference, &what, response, MAX_CONFIG_BYTES).await?;
        manifest::verify_digest(digest, &body)?;
        Ok(body)
    }

    async fn resolve_config(&self, reference: &ImageReference) -> Result<ImageConfig, ImageLookupError> {
        let mut manifest = self.fetch_manifest(reference, reference.manifest_reference()).await?;

        if let Manifest::List(list) = &manifest {
            let descriptor = list.select(&self.platform).ok_or_else(|| ImageLookupError::PlatformNotFound {
                reference: reference.to_string(),
                platform: self.platform.to_string(),
            })?;
            debug!(
                image = %reference,
                platform = %self.platform,
                digest = %descriptor.digest,
                "Resolved platform manifest from index"
            );
            manifest = self.fetch_manifest(reference, &descriptor.digest).await?;
        }

        match manifest {
            Manifest::Image(image) => {
                let blob = self.fetch_blob(reference, &image.config.digest).await?;
                manifest::decode_config_blob(&blob, &image.config.digest)
            }
            Manifest::Legacy(legacy) => legacy.image_config(),
            Manifest::List(_) => Err(ImageLookupError::Decode {
                what: format!("manifest for {}", reference),
                message: "platform entry of an index is itself an index".to_string(),
            }),
        }
    }
}

#[async_trait]
impl ImageConfigSource for RegistryClient {
    async fn fetch_image_config(&self, reference: &ImageReference) -> Result<ImageConfig, ImageLookupError> {
        let started = Instant::now();
        let result = self.resolve_config(reference).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(config) => {
                info!(
                    image = %reference,
                    elapsed_ms = elapsed.as_millis() as u64,
                    command = ?config.command(),
                    "Resolved image config from registry"
                );
                telemetry::record_registry_lookup("ok", elapsed);
            }
            Err(e) => {
                info!(
                    image = %reference,
                    elapsed_ms = elapsed.as_millis() as u64,
                    class = ?e.class(),
                    error = %e,
                    "Registry lookup failed"
                );
                telemetry::record_registry_lookup(telemetry::class_label(e.class()), elapsed);
            }
        }
        result
    }
}
