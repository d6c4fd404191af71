// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Image Domain Types
//!
//! - [`ImageReference`] — a parsed, canonical container image reference.
//! - [`ImageConfig`] — the process fields of an image configuration blob.
//! - [`ImageCommand`] — the argv head a container runs when launched.
//! - [`Platform`] — the `os/architecture[/variant]` used to pick an entry
//!   from a multi-platform index.
//!
//! Parsing follows the Docker normalisation rules: references without a
//! registry host resolve against Docker Hub, single-component Hub
//! repositories live under `library/`, and a missing tag means `latest`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::registry::ImageLookupError;

/// Canonical host name for Docker Hub references.
pub const DOCKER_HUB_REGISTRY: &str = "docker.io";

/// Host actually serving the Docker Hub distribution API.
pub const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

const DEFAULT_TAG: &str = "latest";
const MAX_TAG_LEN: usize = 128;

/// A fully qualified image reference: `registry/repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse and normalise an image reference.
    pub fn parse(input: &str) -> Result<Self, ImageLookupError> {
        let invalid = |reason: &str| ImageLookupError::InvalidReference {
            reference: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if trimmed != input {
            return Err(invalid("reference contains surrounding whitespace"));
        }

        let (name_and_tag, digest) = match trimmed.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|reason| invalid(&reason))?;
                (name, Some(digest.to_string()))
            }
            None => (trimmed, None),
        };

        // A ':' after the last '/' separates the tag; earlier colons belong to a registry port.
        let last_slash = name_and_tag.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &name_and_tag[split + 1..];
                validate_tag(tag).map_err(|reason| invalid(&reason))?;
                (&name_and_tag[..split], Some(tag.to_string()))
            }
            None => (name_and_tag, None),
        };

        if name.is_empty() {
            return Err(invalid("repository name is empty"));
        }

        let (registry, remainder) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first.to_string(), rest.to_string()),
            _ => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
        };

        let registry = if registry == "index.docker.io" || registry == DOCKER_HUB_API_HOST {
            DOCKER_HUB_REGISTRY.to_string()
        } else {
            registry
        };

        let repository = if registry == DOCKER_HUB_REGISTRY && !remainder.contains('/') {
            format!("library/{}", remainder)
        } else {
            remainder
        };

        validate_repository(&repository).map_err(|reason| invalid(&reason))?;

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host as written in the reference (`docker.io` for Hub).
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Host serving the distribution API for this reference.
    pub fn api_host(&self) -> &str {
        if self.registry == DOCKER_HUB_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The `{reference}` path segment for a manifest request. A digest pins
    /// the manifest and takes precedence over the tag.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Token scope requesting pull access to this repository.
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = ImageLookupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn is_registry_host(component: &str) -> bool {
    component == "localhost" || component.contains('.') || component.contains(':')
}

fn validate_repository(repository: &str) -> Result<(), String> {
    for component in repository.split('/') {
        if component.is_empty() {
            return Err("repository contains an empty path component".to_string());
        }
        let bytes = component.as_bytes();
        let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        let is_sep = |b: u8| b == b'.' || b == b'_' || b == b'-';
        if !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
            return Err(format!(
                "path component '{}' must start and end with a lowercase letter or digit",
                component
            ));
        }
        if let Some(bad) = bytes.iter().find(|b| !is_alnum(**b) && !is_sep(**b)) {
            return Err(format!(
                "path component '{}' contains invalid character '{}'",
                component, *bad as char
            ));
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), String> {
    let bytes = tag.as_bytes();
    if bytes.is_empty() {
        return Err("tag is empty".to_string());
    }
    if bytes.len() > MAX_TAG_LEN {
        return Err(format!("tag exceeds {} characters", MAX_TAG_LEN));
    }
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    if !is_word(bytes[0]) {
        return Err(format!("tag '{}' must start with a letter, digit or '_'", tag));
    }
    if bytes.iter().any(|b| !is_word(*b) && *b != b'.' && *b != b'-') {
        return Err(format!("tag '{}' contains invalid characters", tag));
    }
    Ok(())
}

/// Validate an `algorithm:hex` content digest.
pub fn validate_digest(digest: &str) -> Result<(), String> {
    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| format!("digest '{}' is not of the form algorithm:hex", digest))?;
    if algorithm.is_empty()
        || !algorithm
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"+._-".contains(&b))
    {
        return Err(format!("digest algorithm '{}' is invalid", algorithm));
    }
    if !encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("digest '{}' is not hex encoded", digest));
    }
    match algorithm {
        "sha256" if encoded.len() != 64 => Err("sha256 digest must be 64 hex characters".to_string()),
        "sha512" if encoded.len() != 128 => Err("sha512 digest must be 128 hex characters".to_string()),
        _ if encoded.len() < 32 => Err(format!("digest '{}' is too short", digest)),
        _ => Ok(()),
    }
}

/// Command a container executes on start: the entrypoint, or the image's
/// `Cmd` when no entrypoint is configured.
pub type ImageCommand = Vec<String>;

/// Process fields of an image configuration blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,

    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ImageConfig {
    /// The argv head: `Entrypoint` if non-empty, otherwise `Cmd`.
    pub fn command(&self) -> ImageCommand {
        match &self.entrypoint {
            Some(entrypoint) if !entrypoint.is_empty() => entrypoint.clone(),
            _ => self.cmd.clone().unwrap_or_default(),
        }
    }
}

/// Target platform used to select a manifest from an image index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    /// The platform of the running host, using OCI architecture names.
    /// Containers run Linux images regardless of the controller's OS.
    pub fn host() -> Self {
        let (architecture, variant) = match std::env::consts::ARCH {
            "x86_64" => ("amd64", None),
            "x86" => ("386", None),
            "aarch64" => ("arm64", None),
            "arm" => ("arm", Some("v7")),
            "powerpc64" => ("ppc64le", None),
            "s390x" => ("s390x", None),
            "riscv64" => ("riscv64", None),
            other => (other, None),
        };
        Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
            variant: variant.map(str::to_string),
        }
    }

    /// Whether an index entry's platform satisfies this one. A missing
    /// variant on either side matches any variant.
    pub fn matches(&self, os: &str, architecture: &str, variant: Option<&str>) -> bool {
        if self.os != os || self.architecture != architecture {
            return false;
        }
        match (self.variant.as_deref(), variant) {
            (Some(want), Some(have)) => want == have,
            _ => true,
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(*os, *arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: Some(variant.to_string()),
            }),
            _ => Err(format!("invalid platform '{}': expected os/arch[/variant]", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "sha256:4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945";

    #[test]
    fn test_parse_hub_official_image() {
        let r = ImageReference::parse("python:alpine3.6").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.api_host(), "registry-1.docker.io");
        assert_eq!(r.repository(), "library/python");
        assert_eq!(r.tag(), Some("alpine3.6"));
        assert_eq!(r.to_string(), "docker.io/library/python:alpine3.6");
    }

    #[test]
    fn test_parse_hub_user_image_defaults_tag() {
        let r = ImageReference::parse("argoproj/argosay").unwrap();
        assert_eq!(r.repository(), "argoproj/argosay");
        assert_eq!(r.manifest_reference(), "latest");
        assert_eq!(r.pull_scope(), "repository:argoproj/argosay:pull");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/team/app:1.2").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.api_host(), "localhost:5000");
        assert_eq!(r.repository(), "team/app");
        assert_eq!(r.tag(), Some("1.2"));
    }

    #[test]
    fn test_parse_digest_takes_precedence() {
        let input = format!("ghcr.io/org/tool:v1@{}", SHA);
        let r = ImageReference::parse(&input).unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.tag(), Some("v1"));
        assert_eq!(r.manifest_reference(), SHA);
        assert_eq!(r.to_string(), input);
    }

    #[test]
    fn test_parse_digest_only_has_no_default_tag() {
        let r = ImageReference::parse(&format!("busybox@{}", SHA)).unwrap();
        assert_eq!(r.tag(), None);
        assert_eq!(r.to_string(), format!("docker.io/library/busybox@{}", SHA));
    }

    #[test]
    fn test_hub_aliases_normalise() {
        let a = ImageReference::parse("index.docker.io/library/alpine:3").unwrap();
        let b = ImageReference::parse("alpine:3").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_rejects_invalid_references() {
        for input in ["", " alpine", "Alpine:3", "alpine:", "alpine:-x", "a//b", "alpine@sha256:abc", "-lead/x"] {
            let err = ImageReference::parse(input).unwrap_err();
            assert!(
                matches!(err, ImageLookupError::InvalidReference { .. }),
                "expected InvalidReference for {:?}, got {:?}",
                input,
                err
            );
        }
    }

    #[test]
    fn test_command_prefers_entrypoint() {
        let config = ImageConfig {
            entrypoint: Some(vec!["/argosay".to_string()]),
            cmd: Some(vec!["echo".to_string()]),
            ..Default::default()
        };
        assert_eq!(config.command(), vec!["/argosay"]);

        let config = ImageConfig {
            entrypoint: Some(vec![]),
            cmd: Some(vec!["python3".to_string()]),
            ..Default::default()
        };
        assert_eq!(config.command(), vec!["python3"]);

        assert!(ImageConfig::default().command().is_empty());
    }

    #[test]
    fn test_platform_parse_and_match() {
        let p: Platform = "linux/arm/v7".parse().unwrap();
        assert!(p.matches("linux", "arm", Some("v7")));
        assert!(!p.matches("linux", "arm", Some("v6")));
        assert!(p.matches("linux", "arm", None));
        assert!(!p.matches("windows", "arm", Some("v7")));
        assert!("linux".parse::<Platform>().is_err());
        assert_eq!(Platform::new("linux", "amd64").to_string(), "linux/amd64");
    }
}
