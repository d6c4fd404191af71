// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Installs the process-wide recorder, so it lives in its own test binary.

use reconcile_gate_core::domain::gate_config::MetricsConfig;
use reconcile_gate_core::infrastructure::telemetry::init_metrics;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_metrics_init_installs_once() {
    let config = MetricsConfig {
        enabled: true,
        bind_address: "127.0.0.1".to_string(),
        port: 0,
    };

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let config = config.clone();
            tokio::spawn(async move { init_metrics(&config) })
        })
        .collect();

    for result in futures::future::join_all(callers).await {
        assert!(result.unwrap().is_ok());
    }
    assert!(init_metrics(&config).is_ok());
}
