// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Keyed Mutual Exclusion
//!
//! [`KeyLock`] grants exclusive possession of an opaque key to one task at a
//! time. Tasks contending for different keys never block each other.
//!
//! Each key maps to its own `tokio::sync::Mutex`, so waiters on one key are
//! served in FIFO order. A map entry lives exactly as long as some task holds
//! or awaits the key: the last [`KeyLockGuard`] for a key removes it, which
//! bounds memory to the working set of keys.
//!
//! Release is tied to the guard value, so unlocking a key that is not held
//! cannot be expressed.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slot = Arc<Mutex<()>>;
type Slots<K> = Arc<RwLock<HashMap<K, Slot>>>;

/// Mutual exclusion keyed by an opaque identifier.
pub struct KeyLock<K = String> {
    slots: Slots<K>,
}

impl<K> Clone for KeyLock<K> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K> Default for KeyLock<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K> std::fmt::Debug for KeyLock<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLock").field("keys", &self.slots.read().len()).finish()
    }
}

impl<K> KeyLock<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other task holds `key`, then take it.
    ///
    /// Dropping the returned future before it resolves gives up the place in
    /// the queue without leaking the key's entry.
    pub async fn lock(&self, key: K) -> KeyLockGuard<K> {
        let slot = self.slot_for(&key);
        let mut guard = KeyLockGuard::pending(Arc::clone(&self.slots), key, Arc::clone(&slot));
        guard.held = Some(slot.lock_owned().await);
        guard
    }

    /// Take `key` only if nobody holds it.
    pub fn try_lock(&self, key: K) -> Option<KeyLockGuard<K>> {
        let slot = self.slot_for(&key);
        let mut guard = KeyLockGuard::pending(Arc::clone(&self.slots), key, Arc::clone(&slot));
        match slot.try_lock_owned() {
            Ok(held) => {
                guard.held = Some(held);
                Some(guard)
            }
            Err(_) => None,
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// The mutex for `key`, inserted if absent. The returned clone is counted
    /// by release, so it must be taken while the map is locked.
    fn slot_for(&self, key: &K) -> Slot {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(key.clone()).or_default())
    }
}

/// Exclusive possession of one key. Dropping it releases the key.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyLockGuard<K: Hash + Eq> {
    slots: Slots<K>,
    key: K,
    slot: Option<Slot>,
    held: Option<OwnedMutexGuard<()>>,
}

impl<K: Hash + Eq> KeyLockGuard<K> {
    fn pending(slots: Slots<K>, key: K, slot: Slot) -> Self {
        Self {
            slots,
            key,
            slot: Some(slot),
            held: None,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Release the key now.
    pub fn unlock(self) {
        drop(self);
    }
}

impl<K: Hash + Eq + std::fmt::Debug> std::fmt::Debug for KeyLockGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("key", &self.key)
            .field("held", &self.held.is_some())
            .finish()
    }
}

impl<K: Hash + Eq> Drop for KeyLockGuard<K> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        // Handles are only cloned under the map lock, so the count seen here is exact.
        let mut slots = self.slots.write();
        drop(self.held.take());
        let ours = Arc::as_ptr(&slot);
        drop(slot);
        let idle = slots
            .get(&self.key)
            .is_some_and(|current| Arc::as_ptr(current) == ours && Arc::strong_count(current) == 1);
        if idle {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_and_release_removes_entry() {
        let locks = KeyLock::new();
        let guard = locks.lock("a".to_string()).await;
        assert_eq!(guard.key(), "a");
        assert_eq!(locks.len(), 1);
        guard.unlock();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_try_lock_refuses_held_key() {
        let locks: KeyLock<&'static str> = KeyLock::new();
        let held = locks.try_lock("a").unwrap();
        assert!(locks.try_lock("a").is_none());
        assert!(locks.try_lock("b").is_some());
        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(locks.is_empty());
        assert!(locks.try_lock("a").is_some());
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let locks = KeyLock::new();
        let first = locks.lock(1u64).await;

        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let guard = contender.lock(1u64).await;
            assert_eq!(contender.len(), 1);
            drop(guard);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_wait_does_not_leak() {
        let locks = KeyLock::new();
        let held = locks.lock("k").await;

        let timed_out = tokio::time::timeout(Duration::from_millis(10), locks.lock("k")).await;
        assert!(timed_out.is_err());
        assert_eq!(locks.len(), 1);

        drop(held);
        assert!(locks.is_empty());
    }
}
