// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use reconcile_gate_core::domain::gate_config::GateConfigManifest;
use reconcile_gate_core::domain::identity::Principal;
use reconcile_gate_core::infrastructure::rate_limiter::RateLimiter;
use reconcile_gate_core::presentation::RateLimitLayerState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const GATE_YAML: &str = r#"
apiVersion: reconcile-gate/v1
kind: GateConfig
metadata:
  name: controller-a
spec:
  rate_limit:
    limit: 1
    burst: 3
    sweep_interval: 1ms
    idle_timeout: 0s
    ip_key_headers: ["X-Forwarded-For"]
"#;

#[tokio::test]
async fn test_evicted_visitor_gets_fresh_bucket() {
    let manifest = GateConfigManifest::from_yaml_str(GATE_YAML).unwrap();
    manifest.validate().unwrap();

    let limiter = RateLimiter::from_config(&manifest.spec.rate_limit).unwrap();
    let principal = Principal::from("1.2.3.4");
    let first = limiter.get_visitor(&principal);
    for _ in 0..3 {
        assert!(first.allow());
    }
    assert!(!first.allow());

    let stop = CancellationToken::new();
    limiter.spawn_sweeper(stop.clone());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = limiter.get_visitor(&principal);
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.allow(), "an evicted bucket must not carry its debt forward");
    stop.cancel();
}

#[test]
fn test_layer_state_from_config() {
    let manifest = GateConfigManifest::from_yaml_str(GATE_YAML).unwrap();
    let state = RateLimitLayerState::from_config(&manifest.spec.rate_limit).unwrap();
    assert_eq!(state.limiter().burst(), 3);
    assert!(state.limiter().is_enabled());
}
