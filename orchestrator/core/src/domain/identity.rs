// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Object & Principal Identity
//!
//! Value objects shared by every admission component:
//!
//! - [`Uid`] — lifetime-stable object identifier.
//! - [`ResourceVersion`] — opaque monotone token issued by the upstream store.
//! - [`ObjectIdentity`] — the `(Uid, ResourceVersion)` pair carried by a watch event.
//! - [`Principal`] — the source of a request, usually a client IP.
//!
//! # ResourceVersion ordering
//!
//! The upstream store issues unpadded decimal integers, so comparing the raw
//! strings would put `"10"` before `"9"`. Versions therefore order as follows:
//!
//! 1. Two decimal tokens compare numerically at any length (`"9" < "10"`).
//! 2. Numerically equal tokens with different spellings (`"007"`, `"7"`) fall
//!    back to byte order, keeping `Ord` consistent with `Eq`.
//! 3. Any decimal token orders before any non-decimal token.
//! 4. Two non-decimal tokens compare lexicographically (`"a" < "b"`).
//!
//! Versions are only meaningful relative to other versions of the same [`Uid`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Lifetime-stable identifier of a watched object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub String);

impl Uid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Opaque version token of a single object. See the module docs for ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceVersion(pub String);

impl ResourceVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The token's digits without leading zeros, if it is a decimal integer.
    fn digits(&self) -> Option<&str> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(self.0.trim_start_matches('0'))
    }
}

/// Compare unpadded digit strings of any length by value.
fn cmp_digits(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

impl Ord for ResourceVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.digits(), other.digits()) {
            (Some(a), Some(b)) => cmp_digits(a, b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ResourceVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceVersion {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identity of one observed version of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub uid: Uid,
    pub resource_version: ResourceVersion,
}

impl ObjectIdentity {
    pub fn new(uid: impl Into<String>, resource_version: impl Into<String>) -> Self {
        Self {
            uid: Uid::new(uid),
            resource_version: ResourceVersion::new(resource_version),
        }
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.uid, self.resource_version)
    }
}

/// Source of a request for rate-limiting purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(principal: impl Into<String>) -> Self {
        Self(principal.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Principal {
    fn from(value: String) -> Self {
        Self(value)
    }
}
