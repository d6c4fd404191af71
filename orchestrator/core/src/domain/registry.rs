// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Image Registry Port
//!
//! [`ImageConfigSource`] is the seam between the image index and whatever
//! answers "what is the configuration of this image?". The production
//! implementation is [`crate::infrastructure::registry::RegistryClient`],
//! which speaks the OCI distribution API; tests substitute in-memory fakes.
//!
//! [`ImageLookupError`] is shared by both sides. It is `Clone` because one
//! coalesced registry round-trip answers every waiter for the same image.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::image::{ImageConfig, ImageReference};

/// How a caller should treat a failed lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed if retried later (network, 5xx, auth, deadline).
    Transient,
    /// Will fail again for the same input (bad reference, 404, bad blob).
    Terminal,
    /// The caller abandoned the lookup.
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum ImageLookupError {
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("authentication against {registry} failed: {message}")]
    Authentication { registry: String, message: String },

    #[error("transport error talking to {registry}: {message}")]
    Transport { registry: String, message: String },

    #[error("{registry} returned HTTP {status} for {url}")]
    RegistryStatus { registry: String, status: u16, url: String },

    #[error("{what} not found in {registry}")]
    NotFound { registry: String, what: String },

    #[error("image index {reference} has no manifest for platform {platform}")]
    PlatformNotFound { reference: String, platform: String },

    #[error("unsupported manifest media type '{media_type}' for {reference}")]
    UnsupportedMediaType { reference: String, media_type: String },

    #[error("failed to decode {what}: {message}")]
    Decode { what: String, message: String },

    #[error("content of {digest} does not match its digest (got {actual})")]
    DigestMismatch { digest: String, actual: String },

    #[error("lookup of {reference} exceeded its deadline")]
    DeadlineExceeded { reference: String },

    #[error("lookup of {reference} was cancelled")]
    Cancelled { reference: String },
}

impl ImageLookupError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Authentication { .. } | Self::Transport { .. } | Self::DeadlineExceeded { .. } => {
                ErrorClass::Transient
            }
            Self::RegistryStatus { status, .. } if *status >= 500 || *status == 429 => ErrorClass::Transient,
            Self::Cancelled { .. } => ErrorClass::Cancelled,
            _ => ErrorClass::Terminal,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_terminal(&self) -> bool {
        self.class() == ErrorClass::Terminal
    }
}

/// Resolves an image reference to its configuration.
#[async_trait]
pub trait ImageConfigSource: Send + Sync {
    async fn fetch_image_config(&self, reference: &ImageReference) -> Result<ImageConfig, ImageLookupError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> ImageLookupError {
        ImageLookupError::RegistryStatus {
            registry: "r".to_string(),
            status: code,
            url: "u".to_string(),
        }
    }

    #[test]
    fn test_error_classes() {
        assert!(status(503).is_retriable());
        assert!(status(429).is_retriable());
        assert!(status(400).is_terminal());
        assert!(ImageLookupError::NotFound {
            registry: "r".to_string(),
            what: "manifest".to_string()
        }
        .is_terminal());
        assert!(ImageLookupError::Authentication {
            registry: "r".to_string(),
            message: "denied".to_string()
        }
        .is_retriable());
        let cancelled = ImageLookupError::Cancelled { reference: "x".to_string() };
        assert_eq!(cancelled.class(), ErrorClass::Cancelled);
        assert!(!cancelled.is_retriable() && !cancelled.is_terminal());
    }
}
