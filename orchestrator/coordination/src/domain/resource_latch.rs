// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Resource Version Latch
//!
//! Remembers the highest [`ResourceVersion`] written for each object so that
//! events carrying an older version can be dropped before reconciling.
//!
//! The retained version for a UID only ever grows; see
//! [`ResourceVersion`] for how versions order.

use parking_lot::RwLock;
use reconcile_gate_core::domain::identity::{ObjectIdentity, ResourceVersion, Uid};
use std::collections::HashMap;
use tracing::trace;

/// Monotone per-object version gate.
#[derive(Debug, Default)]
pub struct ResourceLatch {
    versions: RwLock<HashMap<Uid, ResourceVersion>>,
}

impl ResourceLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `object`'s version unless a higher one is already known.
    pub fn update(&self, object: &ObjectIdentity) {
        let mut versions = self.versions.write();
        match versions.get_mut(&object.uid) {
            Some(current) if *current >= object.resource_version => {}
            Some(current) => {
                trace!(object = %object, previous = %current, "Advancing resource latch");
                *current = object.resource_version.clone();
            }
            None => {
                versions.insert(object.uid.clone(), object.resource_version.clone());
            }
        }
    }

    /// True if `object` is not older than the latched version of its UID.
    pub fn pass(&self, object: &ObjectIdentity) -> bool {
        self.versions
            .read()
            .get(&object.uid)
            .is_none_or(|latched| *latched <= object.resource_version)
    }

    /// Forget `object`'s UID entirely, e.g. once the object is deleted.
    pub fn remove(&self, object: &ObjectIdentity) {
        self.versions.write().remove(&object.uid);
    }

    pub fn version_of(&self, uid: &Uid) -> Option<ResourceVersion> {
        self.versions.read().get(uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.versions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_uid_passes() {
        let latch = ResourceLatch::new();
        assert!(latch.pass(&ObjectIdentity::new("u1", "1")));
        assert!(latch.is_empty());
    }

    #[test]
    fn test_stale_version_rejected() {
        let latch = ResourceLatch::new();
        latch.update(&ObjectIdentity::new("u1", "b"));
        assert!(!latch.pass(&ObjectIdentity::new("u1", "a")));
        assert!(latch.pass(&ObjectIdentity::new("u1", "b")));
        assert!(latch.pass(&ObjectIdentity::new("u1", "c")));
    }

    #[test]
    fn test_update_never_lowers() {
        let latch = ResourceLatch::new();
        latch.update(&ObjectIdentity::new("u1", "10"));
        latch.update(&ObjectIdentity::new("u1", "9"));
        assert_eq!(latch.version_of(&Uid::from("u1")), Some(ResourceVersion::from("10")));
        latch.update(&ObjectIdentity::new("u1", "11"));
        assert_eq!(latch.version_of(&Uid::from("u1")), Some(ResourceVersion::from("11")));
    }

    #[test]
    fn test_update_is_idempotent() {
        let latch = ResourceLatch::new();
        let object = ObjectIdentity::new("u1", "5");
        latch.update(&object);
        latch.update(&object);
        assert_eq!(latch.len(), 1);
        assert_eq!(latch.version_of(&object.uid), Some(object.resource_version.clone()));
    }

    #[test]
    fn test_remove_forgets_uid() {
        let latch = ResourceLatch::new();
        latch.update(&ObjectIdentity::new("u1", "7"));
        latch.remove(&ObjectIdentity::new("u1", "7"));
        latch.remove(&ObjectIdentity::new("missing", "1"));
        assert!(latch.is_empty());
        assert!(latch.pass(&ObjectIdentity::new("u1", "1")));
    }
}
