// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Admission Use Case
//!
//! Application service deciding whether a watch event may be reconciled now.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** Gate reconciliation of one object version
//! - **Collaborators:**
//!   - Domain: KeyLock, ResourceLatch
//!   - Infrastructure: RateLimiter, ImageIndex (from `reconcile-gate-core`)
//!
//! # Flow
//!
//! 1. Charge the principal one token (refused → `RateLimited`)
//! 2. Drop events older than the latched version (`Stale`)
//! 3. Take the per-UID lock
//! 4. Re-check the latch, since a concurrent holder may have committed a
//!    newer version while this task waited
//! 5. Hand back an [`AdmissionTicket`]; the lock is held until the ticket is
//!    committed, forgotten or dropped
//!
//! # Error Handling
//!
//! [`AdmissionError`] distinguishes deferral (`RateLimited`, caller requeues
//! after `retry_after`) from discard (`Stale`).

use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use reconcile_gate_core::domain::gate_config::GateConfigSpec;
use reconcile_gate_core::domain::identity::{ObjectIdentity, Principal, ResourceVersion, Uid};
use reconcile_gate_core::domain::image::ImageCommand;
use reconcile_gate_core::domain::registry::ImageLookupError;
use reconcile_gate_core::infrastructure::image_index::{ImageIndex, LookupContext};
use reconcile_gate_core::infrastructure::keychain::Keychain;
use reconcile_gate_core::infrastructure::rate_limiter::{Admission, RateLimiter};

use crate::domain::key_lock::{KeyLock, KeyLockGuard};
use crate::domain::resource_latch::ResourceLatch;

pub const ADMISSIONS_TOTAL: &str = "reconcile_gate_admissions_total";

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("principal {principal} is rate limited; retry after {retry_after:?}")]
    RateLimited { principal: Principal, retry_after: Duration },

    #[error("{object} is stale; latest known version is {latest}")]
    Stale { object: ObjectIdentity, latest: ResourceVersion },

    #[error("ticket for {expected} cannot commit a version of {actual}")]
    UidMismatch { expected: Uid, actual: Uid },

    #[error(transparent)]
    Image(#[from] ImageLookupError),
}

impl AdmissionError {
    /// Whether the event should be requeued rather than dropped.
    pub fn is_retriable(&self) -> bool {
        match self {
            AdmissionError::RateLimited { .. } => true,
            AdmissionError::Stale { .. } | AdmissionError::UidMismatch { .. } => false,
            AdmissionError::Image(e) => e.is_retriable(),
        }
    }
}

/// Admission Use Case
#[async_trait]
pub trait AdmissionService: Send + Sync {
    /// Admit `object` for reconciliation on behalf of `principal`.
    ///
    /// Suspends while another task holds the object's UID.
    async fn admit(&self, principal: &Principal, object: &ObjectIdentity) -> Result<AdmissionTicket, AdmissionError>;
}

/// Permission to reconcile one object version. Holds the object's lock.
#[must_use = "the object lock is released as soon as the ticket is dropped"]
#[derive(Debug)]
pub struct AdmissionTicket {
    object: ObjectIdentity,
    latch: Arc<ResourceLatch>,
    images: ImageIndex,
    guard: KeyLockGuard<Uid>,
}

impl AdmissionTicket {
    pub fn object(&self) -> &ObjectIdentity {
        &self.object
    }

    /// Resolve the command an image runs, while still holding the lock.
    pub async fn resolve_image(&self, image: &str) -> Result<ImageCommand, AdmissionError> {
        Ok(self.images.lookup(image).await?)
    }

    pub async fn resolve_image_with(&self, image: &str, ctx: &LookupContext) -> Result<ImageCommand, AdmissionError> {
        Ok(self.images.lookup_with(image, ctx).await?)
    }

    /// Record the version written back by the reconcile and release the lock.
    pub fn commit(self, written: &ObjectIdentity) -> Result<(), AdmissionError> {
        if written.uid != self.object.uid {
            return Err(AdmissionError::UidMismatch {
                expected: self.object.uid.clone(),
                actual: written.uid.clone(),
            });
        }
        self.latch.update(written);
        debug!(object = %written, "Committed reconciled version");
        self.guard.unlock();
        Ok(())
    }

    /// The object is gone: drop its latched version and release the lock.
    pub fn forget(self) {
        self.latch.remove(&self.object);
        debug!(object = %self.object, "Forgot deleted object");
        self.guard.unlock();
    }
}

/// Standard implementation of AdmissionService
#[derive(Clone)]
pub struct StandardAdmissionService {
    limiter: Arc<RateLimiter>,
    latch: Arc<ResourceLatch>,
    locks: KeyLock<Uid>,
    images: ImageIndex,
}

impl std::fmt::Debug for StandardAdmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardAdmissionService")
            .field("limiter", &self.limiter)
            .field("latched", &self.latch.len())
            .field("locked", &self.locks.len())
            .field("images", &self.images)
            .finish()
    }
}

impl StandardAdmissionService {
    pub fn new(limiter: Arc<RateLimiter>, latch: Arc<ResourceLatch>, locks: KeyLock<Uid>, images: ImageIndex) -> Self {
        Self {
            limiter,
            latch,
            locks,
            images,
        }
    }

    /// Wire every component from configuration.
    pub fn from_config(spec: &GateConfigSpec, keychain: Arc<dyn Keychain>) -> anyhow::Result<Self> {
        let limiter = RateLimiter::from_config(&spec.rate_limit)?;
        let images = ImageIndex::from_config(spec, keychain)?;
        Ok(Self::new(
            Arc::new(limiter),
            Arc::new(ResourceLatch::new()),
            KeyLock::new(),
            images,
        ))
    }

    /// Start evicting idle rate-limit buckets until `stop` is cancelled.
    pub fn spawn_sweeper(&self, stop: CancellationToken) {
        self.limiter.spawn_sweeper(stop);
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn latch(&self) -> &Arc<ResourceLatch> {
        &self.latch
    }

    pub fn locks(&self) -> &KeyLock<Uid> {
        &self.locks
    }

    pub fn images(&self) -> &ImageIndex {
        &self.images
    }

    fn stale(&self, object: &ObjectIdentity) -> Option<AdmissionError> {
        if self.latch.pass(object) {
            return None;
        }
        let latest = self.latch.version_of(&object.uid)?;
        Some(AdmissionError::Stale {
            object: object.clone(),
            latest,
        })
    }
}

#[async_trait]
impl AdmissionService for StandardAdmissionService {
    async fn admit(&self, principal: &Principal, object: &ObjectIdentity) -> Result<AdmissionTicket, AdmissionError> {
        if let Admission::Limited { retry_after } = self.limiter.get_visitor(principal).try_acquire() {
            warn!(principal = %principal, object = %object, retry_after_ms = retry_after.as_millis() as u64, "Admission rate limited");
            counter!(ADMISSIONS_TOTAL, "outcome" => "rate_limited").increment(1);
            return Err(AdmissionError::RateLimited {
                principal: principal.clone(),
                retry_after,
            });
        }

        if let Some(err) = self.stale(object) {
            debug!(object = %object, "Dropping stale event");
            counter!(ADMISSIONS_TOTAL, "outcome" => "stale").increment(1);
            return Err(err);
        }

        let guard = self.locks.lock(object.uid.clone()).await;

        if let Some(err) = self.stale(object) {
            debug!(object = %object, "Event went stale while waiting for lock");
            counter!(ADMISSIONS_TOTAL, "outcome" => "stale").increment(1);
            return Err(err);
        }

        debug!(object = %object, principal = %principal, "Admitted for reconciliation");
        counter!(ADMISSIONS_TOTAL, "outcome" => "admitted").increment(1);
        Ok(AdmissionTicket {
            object: object.clone(),
            latch: Arc::clone(&self.latch),
            images: self.images.clone(),
            guard,
        })
    }
}
