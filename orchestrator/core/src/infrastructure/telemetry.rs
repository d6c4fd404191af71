// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Logging and metrics bootstrap, plus the metric names the gate emits.
//!
//! Recording goes through the `metrics` facade, so nothing is exported until
//! an embedding process calls [`init_metrics`].

use anyhow::Context;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use parking_lot::Mutex;
use std::time::Duration;

use crate::domain::gate_config::{LoggingConfig, MetricsConfig};
use crate::domain::registry::ErrorClass;

pub const RATE_LIMIT_ALLOWED: &str = "reconcile_gate_rate_limit_allowed_total";
pub const RATE_LIMIT_REJECTED: &str = "reconcile_gate_rate_limit_rejected_total";
pub const RATE_LIMIT_EVICTED: &str = "reconcile_gate_rate_limit_evicted_total";
pub const RATE_LIMIT_VISITORS: &str = "reconcile_gate_rate_limit_visitors";
pub const IMAGE_CACHE_HITS: &str = "reconcile_gate_image_cache_hits_total";
pub const IMAGE_CACHE_MISSES: &str = "reconcile_gate_image_cache_misses_total";
pub const IMAGE_LOOKUPS_COALESCED: &str = "reconcile_gate_image_lookups_coalesced_total";
pub const REGISTRY_REQUESTS: &str = "reconcile_gate_registry_requests_total";
pub const REGISTRY_LOOKUP_SECONDS: &str = "reconcile_gate_registry_lookup_seconds";

static METRICS_INSTALLED: Mutex<bool> = Mutex::new(false);

/// Initialize tracing subscriber for logging. `RUST_LOG` takes precedence
/// over the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "text" => builder.compact().try_init(),
        other => anyhow::bail!("Unknown log format '{}'. Expected 'json' or 'text'", other),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Install the Prometheus recorder with an HTTP listener and register metric
/// descriptions. Must run inside a tokio runtime; later calls are no-ops.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }
    // Held until the recorder is installed so concurrent callers see one install.
    let mut installed = METRICS_INSTALLED.lock();
    if *installed {
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .with_context(|| format!("Invalid metrics listen address {}:{}", config.bind_address, config.port))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus recorder")?;
    *installed = true;

    describe_counter!(RATE_LIMIT_ALLOWED, "Requests admitted by the per-visitor rate limiter");
    describe_counter!(RATE_LIMIT_REJECTED, "Requests refused by the per-visitor rate limiter");
    describe_counter!(RATE_LIMIT_EVICTED, "Visitor buckets evicted for idleness");
    describe_gauge!(RATE_LIMIT_VISITORS, "Visitor buckets currently tracked");
    describe_counter!(IMAGE_CACHE_HITS, "Image command lookups served from cache");
    describe_counter!(IMAGE_CACHE_MISSES, "Image command lookups that missed the cache");
    describe_counter!(IMAGE_LOOKUPS_COALESCED, "Lookups that joined an in-flight registry fetch");
    describe_counter!(REGISTRY_REQUESTS, "Registry config resolutions by outcome");
    describe_histogram!(REGISTRY_LOOKUP_SECONDS, "Duration of registry config resolutions");

    tracing::info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}

pub fn class_label(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Transient => "transient",
        ErrorClass::Terminal => "terminal",
        ErrorClass::Cancelled => "cancelled",
    }
}

pub(crate) fn record_registry_lookup(outcome: &'static str, elapsed: Duration) {
    counter!(REGISTRY_REQUESTS, "outcome" => outcome).increment(1);
    histogram!(REGISTRY_LOOKUP_SECONDS, "outcome" => outcome).record(elapsed.as_secs_f64());
}

pub(crate) fn record_cache_hit() {
    counter!(IMAGE_CACHE_HITS).increment(1);
}

pub(crate) fn record_cache_miss() {
    counter!(IMAGE_CACHE_MISSES).increment(1);
}

pub(crate) fn record_coalesced_lookup() {
    counter!(IMAGE_LOOKUPS_COALESCED).increment(1);
}

pub(crate) fn record_admission(allowed: bool) {
    if allowed {
        counter!(RATE_LIMIT_ALLOWED).increment(1);
    } else {
        counter!(RATE_LIMIT_REJECTED).increment(1);
    }
}

pub(crate) fn record_evictions(evicted: usize, remaining: usize) {
    if evicted > 0 {
        counter!(RATE_LIMIT_EVICTED).increment(evicted as u64);
    }
    gauge!(RATE_LIMIT_VISITORS).set(remaining as f64);
}
