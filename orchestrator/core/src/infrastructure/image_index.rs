// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Image Command Index
//!
//! Bounded LRU cache from canonical image reference to the command the image
//! runs, filled on demand from an [`ImageConfigSource`].
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Avoid a registry round trip per reconcile for the same image
//! - **Integration:** ImageIndex → ImageConfigSource (RegistryClient in production)
//!
//! Concurrent misses for one reference share a single fetch. The map of
//! in-flight fetches only holds weak handles, so a fetch is dropped once every
//! caller waiting on it has given up (deadline or cancellation). Only
//! successful results are cached.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::gate_config::GateConfigSpec;
use crate::domain::image::{ImageCommand, ImageReference};
use crate::domain::registry::{ImageConfigSource, ImageLookupError};
use crate::infrastructure::keychain::Keychain;
use crate::infrastructure::registry::RegistryClient;
use crate::infrastructure::telemetry;

type LookupResult = Result<ImageCommand, ImageLookupError>;
type LookupFuture = BoxFuture<'static, LookupResult>;

/// Bounds on a single lookup.
#[derive(Debug, Clone, Default)]
pub struct LookupContext {
    /// Give up waiting at this instant.
    pub deadline: Option<Instant>,
    /// Give up waiting once this token is cancelled.
    pub cancellation: Option<CancellationToken>,
}

impl LookupContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancellation: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

struct Flight {
    generation: u64,
    handle: WeakShared<LookupFuture>,
}

struct Inner {
    source: Arc<dyn ImageConfigSource>,
    cache: Mutex<LruCache<String, ImageCommand>>,
    in_flight: DashMap<String, Flight>,
    next_generation: AtomicU64,
}

/// Clears a fetch's in-flight entry when the fetch completes or is dropped
/// by its last waiter.
struct FlightGuard {
    inner: Arc<Inner>,
    key: String,
    generation: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let generation = self.generation;
        self.inner
            .in_flight
            .remove_if(&self.key, |_, flight| flight.generation == generation);
    }
}

enum Pending {
    Cached(ImageCommand),
    Waiting(Shared<LookupFuture>),
}

/// Cloneable handle to a shared image command cache.
#[derive(Clone)]
pub struct ImageIndex {
    inner: Arc<Inner>,
    lookup_timeout: Option<Duration>,
}

impl std::fmt::Debug for ImageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageIndex")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("lookup_timeout", &self.lookup_timeout)
            .finish()
    }
}

impl ImageIndex {
    pub fn new(source: Arc<dyn ImageConfigSource>, capacity: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                cache: Mutex::new(LruCache::new(capacity)),
                in_flight: DashMap::new(),
                next_generation: AtomicU64::new(0),
            }),
            lookup_timeout: None,
        }
    }

    /// Deadline applied to lookups whose context carries none.
    pub fn with_lookup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Index backed by a [`RegistryClient`] configured from the gate spec.
    pub fn from_config(spec: &GateConfigSpec, keychain: Arc<dyn Keychain>) -> anyhow::Result<Self> {
        let capacity = NonZeroUsize::new(spec.image_index.capacity)
            .ok_or_else(|| anyhow::anyhow!("image_index.capacity must be greater than zero"))?;
        let platform = spec.image_index.platform()?;
        let client = RegistryClient::new(&spec.registry, keychain, platform)?;
        Ok(Self::new(Arc::new(client), capacity).with_lookup_timeout(spec.image_index.lookup_timeout))
    }

    /// Resolve the command of `image`, from cache when possible.
    pub async fn lookup(&self, image: &str) -> LookupResult {
        self.lookup_with(image, &LookupContext::default()).await
    }

    /// Resolve the command of `image`, giving up at the context's deadline
    /// or cancellation.
    pub async fn lookup_with(&self, image: &str, ctx: &LookupContext) -> LookupResult {
        let reference = ImageReference::parse(image)?;
        let key = reference.to_string();

        if let Some(command) = self.cached(&key) {
            debug!(image = %key, "Image command cache hit");
            telemetry::record_cache_hit();
            return Ok(command);
        }
        debug!(image = %key, "Image command cache miss");
        telemetry::record_cache_miss();

        let shared = match self.join_or_start(key.clone(), reference) {
            Pending::Cached(command) => return Ok(command),
            Pending::Waiting(shared) => shared,
        };

        let deadline = ctx
            .deadline
            .or_else(|| self.lookup_timeout.map(|t| Instant::now() + t));
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async {
            match &ctx.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = shared => result,
            _ = cancelled => {
                debug!(image = %key, "Image lookup cancelled");
                Err(ImageLookupError::Cancelled { reference: key })
            }
            _ = expired => {
                debug!(image = %key, "Image lookup deadline exceeded");
                Err(ImageLookupError::DeadlineExceeded { reference: key })
            }
        }
    }

    fn cached(&self, key: &str) -> Option<ImageCommand> {
        self.inner.cache.lock().get(key).cloned()
    }

    fn join_or_start(&self, key: String, reference: ImageReference) -> Pending {
        match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(shared) = occupied.get().handle.upgrade() {
                    debug!(image = %key, "Joining in-flight image lookup");
                    telemetry::record_coalesced_lookup();
                    return Pending::Waiting(shared);
                }
                // Previous fetch was abandoned by all of its waiters.
                if let Some(command) = self.cached(&key) {
                    return Pending::Cached(command);
                }
                let (flight, shared) = self.start(key, reference);
                if let Some(flight) = flight {
                    occupied.insert(flight);
                }
                Pending::Waiting(shared)
            }
            Entry::Vacant(vacant) => {
                // A fetch may have finished between the cache probe and here.
                if let Some(command) = self.cached(&key) {
                    return Pending::Cached(command);
                }
                let (flight, shared) = self.start(key, reference);
                if let Some(flight) = flight {
                    vacant.insert(flight);
                }
                Pending::Waiting(shared)
            }
        }
    }

    /// Build the shared fetch for `key`. The flight is `None` only if the
    /// future already completed, which an unpolled future cannot have.
    fn start(&self, key: String, reference: ImageReference) -> (Option<Flight>, Shared<LookupFuture>) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);

        let fetch: LookupFuture = async move {
            let flight = FlightGuard { inner, key, generation };
            let result = flight
                .inner
                .source
                .fetch_image_config(&reference)
                .await
                .map(|config| config.command());
            if let Ok(command) = &result {
                flight.inner.cache.lock().put(flight.key.clone(), command.clone());
            }
            drop(flight);
            result
        }
        .boxed();

        let shared = fetch.shared();
        let flight = shared.downgrade().map(|handle| Flight { generation, handle });
        (flight, shared)
    }

    /// Number of cached commands.
    pub fn len(&self) -> usize {
        self.inner.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.cache.lock().cap().get()
    }

    /// Drop every cached command. In-flight fetches still populate the cache.
    pub fn clear(&self) {
        self.inner.cache.lock().clear();
    }
}
