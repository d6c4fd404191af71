// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Manifest and config blob decoding for the OCI distribution API.
//!
//! Understands OCI image indexes and manifests, Docker manifest lists and
//! schema 2 manifests, and legacy schema 1 manifests (whose first history
//! entry embeds the image configuration).

use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};

use crate::domain::image::{ImageConfig, Platform};
use crate::domain::registry::ImageLookupError;

pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Manifests larger than this are rejected before decoding.
pub const MAX_MANIFEST_BYTES: usize = 4 * 1024 * 1024;

/// Config blobs larger than this are rejected before decoding.
pub const MAX_CONFIG_BYTES: usize = 16 * 1024 * 1024;

/// `Accept` header value for manifest requests, most preferred first.
pub fn manifest_accept_header() -> String {
    [
        OCI_IMAGE_INDEX,
        DOCKER_MANIFEST_LIST,
        OCI_IMAGE_MANIFEST,
        DOCKER_MANIFEST_V2,
        DOCKER_MANIFEST_V1_SIGNED,
        DOCKER_MANIFEST_V1,
    ]
    .join(", ")
}

#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub digest: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub platform: Option<DescriptorPlatform>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorPlatform {
    pub os: String,
    pub architecture: String,
    #[serde(default)]
    pub variant: Option<String>,
}

/// A multi-platform index (OCI image index or Docker manifest list).
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestList {
    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    /// Select the entry for `platform`, preferring an exact variant match
    /// over an entry that leaves the variant unspecified.
    pub fn select(&self, platform: &Platform) -> Option<&Descriptor> {
        let candidates: Vec<&Descriptor> = self
            .manifests
            .iter()
            .filter(|d| {
                d.platform.as_ref().is_some_and(|p| {
                    platform.matches(&p.os, &p.architecture, p.variant.as_deref())
                })
            })
            .collect();

        candidates
            .iter()
            .find(|d| {
                d.platform
                    .as_ref()
                    .is_some_and(|p| p.variant.as_deref() == platform.variant.as_deref())
            })
            .or_else(|| candidates.first())
            .copied()
    }
}

/// A single-platform image manifest (OCI or Docker schema 2).
#[derive(Debug, Clone, Deserialize)]
pub struct ImageManifest {
    pub config: Descriptor,
}

/// Docker schema 1 manifest; only the embedded history is used.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyManifest {
    #[serde(default)]
    pub history: Vec<LegacyHistory>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyHistory {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

impl LegacyManifest {
    /// The configuration embedded in the newest history entry.
    pub fn image_config(&self) -> Result<ImageConfig, ImageLookupError> {
        let newest = self.history.first().ok_or_else(|| ImageLookupError::Decode {
            what: "schema 1 manifest".to_string(),
            message: "manifest has no history".to_string(),
        })?;
        decode_config_document(newest.v1_compatibility.as_bytes(), "schema 1 history entry")
    }
}

#[derive(Debug, Clone)]
pub enum Manifest {
    List(ManifestList),
    Image(ImageManifest),
    Legacy(LegacyManifest),
}

/// Fields used to identify a manifest whose response carried no useful
/// `Content-Type`.
#[derive(Deserialize)]
struct ManifestProbe {
    #[serde(rename = "schemaVersion", default)]
    schema_version: Option<u32>,
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
    #[serde(default)]
    config: Option<serde_json::Value>,
}

/// Decode a manifest body, using `content_type` when it names a manifest
/// media type and the document's own shape otherwise.
pub fn decode_manifest(
    content_type: Option<&str>,
    body: &[u8],
    reference: &str,
) -> Result<Manifest, ImageLookupError> {
    let decode_err = |e: serde_json::Error| ImageLookupError::Decode {
        what: format!("manifest {}", reference),
        message: e.to_string(),
    };

    let declared = content_type
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase())
        .filter(|ct| ct.starts_with("application/vnd."));

    let media_type = match declared {
        Some(media_type) => media_type,
        None => {
            let probe: ManifestProbe = serde_json::from_slice(body).map_err(decode_err)?;
            match (probe.media_type, probe.schema_version) {
                (Some(media_type), _) => media_type,
                (None, Some(1)) => DOCKER_MANIFEST_V1.to_string(),
                (None, _) if probe.manifests.is_some() => OCI_IMAGE_INDEX.to_string(),
                (None, _) if probe.config.is_some() => OCI_IMAGE_MANIFEST.to_string(),
                (None, _) => {
                    return Err(ImageLookupError::Decode {
                        what: format!("manifest {}", reference),
                        message: "document is neither an index nor an image manifest".to_string(),
                    })
                }
            }
        }
    };

    match media_type.as_str() {
        OCI_IMAGE_INDEX | DOCKER_MANIFEST_LIST => {
            Ok(Manifest::List(serde_json::from_slice(body).map_err(decode_err)?))
        }
        OCI_IMAGE_MANIFEST | DOCKER_MANIFEST_V2 => {
            Ok(Manifest::Image(serde_json::from_slice(body).map_err(decode_err)?))
        }
        DOCKER_MANIFEST_V1 | DOCKER_MANIFEST_V1_SIGNED => {
            Ok(Manifest::Legacy(serde_json::from_slice(body).map_err(decode_err)?))
        }
        other => Err(ImageLookupError::UnsupportedMediaType {
            reference: reference.to_string(),
            media_type: other.to_string(),
        }),
    }
}

#[derive(Deserialize)]
struct ConfigDocument {
    config: Option<ImageConfig>,
}

fn decode_config_document(body: &[u8], what: &str) -> Result<ImageConfig, ImageLookupError> {
    let document: ConfigDocument = serde_json::from_slice(body).map_err(|e| ImageLookupError::Decode {
        what: what.to_string(),
        message: e.to_string(),
    })?;
    document.config.ok_or_else(|| ImageLookupError::Decode {
        what: what.to_string(),
        message: "missing 'config' object".to_string(),
    })
}

/// Decode an image configuration blob.
pub fn decode_config_blob(body: &[u8], digest: &str) -> Result<ImageConfig, ImageLookupError> {
    decode_config_document(body, &format!("config blob {}", digest))
}

/// Check `body` against a `sha256:` or `sha512:` digest. Other algorithms
/// are accepted unverified.
pub fn verify_digest(digest: &str, body: &[u8]) -> Result<(), ImageLookupError> {
    let actual = match digest.split_once(':') {
        Some(("sha256", _)) => format!("sha256:{}", hex::encode(Sha256::digest(body))),
        Some(("sha512", _)) => format!("sha512:{}", hex::encode(Sha512::digest(body))),
        _ => return Ok(()),
    };
    if actual.eq_ignore_ascii_case(digest) {
        Ok(())
    } else {
        Err(ImageLookupError::DigestMismatch {
            digest: digest.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:aaa", "size": 1,
             "platform": {"os": "linux", "architecture": "amd64"}},
            {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:arm", "size": 1,
             "platform": {"os": "linux", "architecture": "arm64"}},
            {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:v8", "size": 1,
             "platform": {"os": "linux", "architecture": "arm64", "variant": "v8"}},
            {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:att", "size": 1,
             "platform": {"os": "unknown", "architecture": "unknown"}}
        ]
    }"#;

    #[test]
    fn test_decode_index_by_content_type() {
        let manifest = decode_manifest(Some(OCI_IMAGE_INDEX), INDEX.as_bytes(), "x").unwrap();
        let Manifest::List(list) = manifest else {
            panic!("expected an index");
        };
        assert_eq!(list.manifests.len(), 4);
    }

    #[test]
    fn test_select_prefers_exact_variant() {
        let Manifest::List(list) = decode_manifest(None, INDEX.as_bytes(), "x").unwrap() else {
            panic!("expected an index");
        };
        let mut arm = Platform::new("linux", "arm64");
        assert_eq!(list.select(&arm).unwrap().digest, "sha256:arm");
        arm.variant = Some("v8".to_string());
        assert_eq!(list.select(&arm).unwrap().digest, "sha256:v8");
        assert_eq!(list.select(&Platform::new("linux", "amd64")).unwrap().digest, "sha256:aaa");
        assert!(list.select(&Platform::new("linux", "s390x")).is_none());
    }

    #[test]
    fn test_sniffs_manifest_without_content_type() {
        let body = br#"{"schemaVersion": 2, "config": {"digest": "sha256:cfg", "size": 10}, "layers": []}"#;
        let manifest = decode_manifest(Some("application/json; charset=utf-8"), body, "x").unwrap();
        let Manifest::Image(image) = manifest else {
            panic!("expected an image manifest");
        };
        assert_eq!(image.config.digest, "sha256:cfg");
    }

    #[test]
    fn test_legacy_manifest_config() {
        let body = serde_json::json!({
            "schemaVersion": 1,
            "history": [
                {"v1Compatibility": "{\"config\":{\"Cmd\":[\"python3\"],\"Entrypoint\":null}}"},
                {"v1Compatibility": "{\"config\":{\"Cmd\":[\"/bin/sh\"]}}"}
            ]
        })
        .to_string();
        let Manifest::Legacy(legacy) = decode_manifest(Some(DOCKER_MANIFEST_V1_SIGNED), body.as_bytes(), "x").unwrap()
        else {
            panic!("expected a legacy manifest");
        };
        assert_eq!(legacy.image_config().unwrap().command(), vec!["python3"]);
    }

    #[test]
    fn test_unsupported_media_type() {
        let err = decode_manifest(Some("application/vnd.example.thing+json"), b"{}", "x").unwrap_err();
        assert!(matches!(err, ImageLookupError::UnsupportedMediaType { .. }));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_config_blob_requires_config_object() {
        let err = decode_config_blob(br#"{"architecture": "amd64"}"#, "sha256:x").unwrap_err();
        assert!(matches!(err, ImageLookupError::Decode { .. }));
        let err = decode_config_blob(b"not json", "sha256:x").unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_verify_digest() {
        let body = b"hello";
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(body)));
        assert!(verify_digest(&digest, body).is_ok());
        let err = verify_digest(&digest, b"tampered").unwrap_err();
        assert!(matches!(err, ImageLookupError::DigestMismatch { .. }));
        assert!(verify_digest("blake3:abcdef", body).is_ok());
    }
}
