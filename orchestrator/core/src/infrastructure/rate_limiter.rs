// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-Visitor Rate Limiter
//!
//! Every principal (usually a client IP) gets its own token bucket. Buckets
//! are created on first sight and dropped by a background sweeper once the
//! principal has been idle for `idle_timeout`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Admission control in front of the API and the reconcile gate
//! - **Integration:** `Principal` → [`VisitorBucket`] (governor direct limiter)
//!
//! A caller holding an `Arc<VisitorBucket>` keeps a working bucket even if
//! the sweeper evicts it concurrently; the next [`RateLimiter::get_visitor`]
//! for that principal allocates a fresh, full bucket. Evicted buckets share
//! no state with their successors.

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorLimiter};
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::gate_config::RateLimitConfig;
use crate::domain::identity::Principal;
use crate::infrastructure::telemetry;

#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    #[error("invalid rate limit quota: {0}")]
    InvalidQuota(String),
}

/// Outcome of a single admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Limited { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Token bucket dedicated to one principal.
pub struct VisitorBucket {
    principal: Principal,
    limiter: Option<DefaultDirectRateLimiter>,
    last_seen: Mutex<Instant>,
}

impl std::fmt::Debug for VisitorBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitorBucket")
            .field("principal", &self.principal)
            .field("unlimited", &self.limiter.is_none())
            .field("last_seen", &*self.last_seen.lock())
            .finish()
    }
}

impl VisitorBucket {
    fn new(principal: Principal, quota: Option<Quota>) -> Self {
        Self {
            principal,
            limiter: quota.map(GovernorLimiter::direct),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }

    /// Consume one token if available. Never blocks.
    pub fn allow(&self) -> bool {
        self.try_acquire().is_allowed()
    }

    /// Consume one token if available, reporting how long until the next
    /// token accrues when none is.
    pub fn try_acquire(&self) -> Admission {
        self.touch();
        let admission = match &self.limiter {
            None => Admission::Allowed,
            Some(limiter) => match limiter.check() {
                Ok(()) => Admission::Allowed,
                Err(not_until) => Admission::Limited {
                    retry_after: not_until.wait_time_from(DefaultClock::default().now()),
                },
            },
        };
        telemetry::record_admission(admission.is_allowed());
        admission
    }
}

type VisitorMap = DashMap<Principal, Arc<VisitorBucket>>;

/// Principal → bucket registry with idle eviction.
pub struct RateLimiter {
    quota: Option<Quota>,
    limit: f64,
    burst: u32,
    idle_timeout: Duration,
    sweep_interval: Duration,
    visitors: Arc<VisitorMap>,
    stop: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("burst", &self.burst)
            .field("enabled", &self.quota.is_some())
            .field("visitors", &self.visitors.len())
            .finish()
    }
}

/// Quota granting `burst` tokens up front and one more every `1 / limit` seconds.
pub fn quota_for(limit: f64, burst: u32) -> Result<Quota, RateLimitError> {
    if !limit.is_finite() || limit <= 0.0 {
        return Err(RateLimitError::InvalidQuota(format!(
            "limit must be a positive number of tokens per second, got {}",
            limit
        )));
    }
    let burst = NonZeroU32::new(burst)
        .ok_or_else(|| RateLimitError::InvalidQuota("burst must be at least 1".to_string()))?;
    let period = Duration::try_from_secs_f64(1.0 / limit)
        .map_err(|e| RateLimitError::InvalidQuota(format!("limit {} is out of range: {}", limit, e)))?;
    let quota = Quota::with_period(period).ok_or_else(|| {
        RateLimitError::InvalidQuota(format!("limit {} is too high to represent", limit))
    })?;
    Ok(quota.allow_burst(burst))
}

impl RateLimiter {
    /// Limiter with `limit` tokens per second and `burst` capacity per
    /// principal. No sweeper runs until [`RateLimiter::spawn_sweeper`].
    pub fn new(limit: f64, burst: u32) -> Result<Self, RateLimitError> {
        Self::from_config(&RateLimitConfig {
            limit,
            burst,
            ..RateLimitConfig::default()
        })
    }

    pub fn from_config(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        let quota = if config.enabled {
            Some(quota_for(config.limit, config.burst)?)
        } else {
            None
        };
        if config.sweep_interval.is_zero() {
            return Err(RateLimitError::InvalidQuota(
                "sweep_interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            quota,
            limit: config.limit,
            burst: config.burst,
            idle_timeout: config.idle_timeout,
            sweep_interval: config.sweep_interval,
            visitors: Arc::new(DashMap::new()),
            stop: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Override the sweep cadence and idle threshold.
    pub fn with_eviction(mut self, sweep_interval: Duration, idle_timeout: Duration) -> Self {
        self.sweep_interval = sweep_interval.max(Duration::from_millis(1));
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub fn is_enabled(&self) -> bool {
        self.quota.is_some()
    }

    /// The bucket for `principal`, created on first sight.
    pub fn get_visitor(&self, principal: &Principal) -> Arc<VisitorBucket> {
        if let Some(bucket) = self.visitors.get(principal) {
            bucket.touch();
            return Arc::clone(bucket.value());
        }
        let bucket = self
            .visitors
            .entry(principal.clone())
            .or_insert_with(|| {
                debug!(principal = %principal, "Allocating visitor bucket");
                Arc::new(VisitorBucket::new(principal.clone(), self.quota))
            })
            .value()
            .clone();
        bucket.touch();
        bucket
    }

    /// Convenience for `get_visitor(principal).allow()`.
    pub fn allow(&self, principal: &Principal) -> bool {
        self.get_visitor(principal).allow()
    }

    /// Number of tracked visitors.
    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }

    /// Drop every bucket idle for at least the idle timeout. Returns the
    /// number evicted.
    pub fn sweep(&self) -> usize {
        sweep_idle(&self.visitors, self.idle_timeout)
    }

    /// Start the idle sweeper on the current tokio runtime. It stops when
    /// `stop` is cancelled or when this limiter is dropped. Calling this
    /// again replaces the previous sweeper.
    pub fn spawn_sweeper(&self, stop: CancellationToken) {
        let visitors = Arc::clone(&self.visitors);
        let own_stop = self.stop.clone();
        let interval = self.sweep_interval;
        let idle_timeout = self.idle_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_ms = interval.as_millis() as u64,
                idle_timeout_ms = idle_timeout.as_millis() as u64,
                "Visitor sweeper started"
            );
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = own_stop.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep_idle(&visitors, idle_timeout);
                    }
                }
            }
            info!("Visitor sweeper stopped");
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Whether a sweeper task is currently running.
    pub fn sweeper_running(&self) -> bool {
        self.sweeper.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn sweep_idle(visitors: &VisitorMap, idle_timeout: Duration) -> usize {
    let now = Instant::now();
    let mut evicted = 0;
    visitors.retain(|principal, bucket| {
        let keep = bucket.idle_for(now) < idle_timeout;
        if !keep {
            debug!(principal = %principal, "Evicting idle visitor bucket");
            evicted += 1;
        }
        keep
    });
    telemetry::record_evictions(evicted, visitors.len());
    evicted
}
