// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use reconcile_gate_coordination::application::{AdmissionError, AdmissionService, StandardAdmissionService};
use reconcile_gate_coordination::domain::{KeyLock, ResourceLatch};
use reconcile_gate_core::domain::identity::{ObjectIdentity, Principal, ResourceVersion, Uid};
use reconcile_gate_core::domain::image::{ImageConfig, ImageReference};
use reconcile_gate_core::domain::registry::{ImageConfigSource, ImageLookupError};
use reconcile_gate_core::infrastructure::image_index::ImageIndex;
use reconcile_gate_core::infrastructure::rate_limiter::RateLimiter;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct MockImageSource {
    calls: AtomicUsize,
}

#[async_trait]
impl ImageConfigSource for MockImageSource {
    async fn fetch_image_config(&self, reference: &ImageReference) -> Result<ImageConfig, ImageLookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match reference.repository() {
            "argoproj/argosay" => Ok(ImageConfig {
                entrypoint: Some(vec!["/argosay".to_string()]),
                ..ImageConfig::default()
            }),
            _ => Err(ImageLookupError::NotFound {
                registry: reference.registry().to_string(),
                what: reference.to_string(),
            }),
        }
    }
}

fn service(limit: f64, burst: u32) -> (StandardAdmissionService, Arc<MockImageSource>) {
    let source = Arc::new(MockImageSource {
        calls: AtomicUsize::new(0),
    });
    let images = ImageIndex::new(
        Arc::clone(&source) as Arc<dyn ImageConfigSource>,
        NonZeroUsize::new(16).unwrap(),
    );
    let service = StandardAdmissionService::new(
        Arc::new(RateLimiter::new(limit, burst).unwrap()),
        Arc::new(ResourceLatch::new()),
        KeyLock::new(),
        images,
    );
    (service, source)
}

fn controller() -> Principal {
    Principal::from("workflow-controller")
}

#[tokio::test]
async fn test_commit_makes_older_events_stale() {
    let (service, _) = service(100.0, 100);

    let ticket = service.admit(&controller(), &ObjectIdentity::new("wf-1", "3")).await.unwrap();
    ticket.commit(&ObjectIdentity::new("wf-1", "4")).unwrap();
    assert!(service.locks().is_empty());

    let err = service
        .admit(&controller(), &ObjectIdentity::new("wf-1", "3"))
        .await
        .unwrap_err();
    match &err {
        AdmissionError::Stale { latest, .. } => assert_eq!(latest, &ResourceVersion::from("4")),
        other => panic!("expected stale, got {:?}", other),
    }
    assert!(!err.is_retriable());

    assert!(service.admit(&controller(), &ObjectIdentity::new("wf-1", "4")).await.is_ok());
}

#[tokio::test]
async fn test_rate_limited_principal_is_deferred() {
    let (service, _) = service(1.0, 1);

    let ticket = service.admit(&controller(), &ObjectIdentity::new("wf-1", "1")).await.unwrap();
    drop(ticket);

    let err = service
        .admit(&controller(), &ObjectIdentity::new("wf-2", "1"))
        .await
        .unwrap_err();
    match &err {
        AdmissionError::RateLimited { retry_after, .. } => assert!(*retry_after <= Duration::from_secs(1)),
        other => panic!("expected rate limit, got {:?}", other),
    }
    assert!(err.is_retriable());

    // Other principals keep their own budget.
    assert!(service
        .admit(&Principal::from("10.0.0.9"), &ObjectIdentity::new("wf-2", "1"))
        .await
        .is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiter_rechecks_latch_after_lock() {
    let (service, _) = service(100.0, 100);
    let ticket = service.admit(&controller(), &ObjectIdentity::new("wf-1", "1")).await.unwrap();

    let contender = service.clone();
    let waiting = tokio::spawn(async move { contender.admit(&controller(), &ObjectIdentity::new("wf-1", "1")).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiting.is_finished());

    ticket.commit(&ObjectIdentity::new("wf-1", "2")).unwrap();
    let result = waiting.await.unwrap();
    assert!(matches!(result, Err(AdmissionError::Stale { .. })));
    assert!(service.locks().is_empty());
}

#[tokio::test]
async fn test_forget_clears_latch() {
    let (service, _) = service(100.0, 100);
    let ticket = service.admit(&controller(), &ObjectIdentity::new("wf-1", "9")).await.unwrap();
    ticket.commit(&ObjectIdentity::new("wf-1", "9")).unwrap();

    let ticket = service.admit(&controller(), &ObjectIdentity::new("wf-1", "9")).await.unwrap();
    ticket.forget();

    assert_eq!(service.latch().version_of(&Uid::from("wf-1")), None);
    assert!(service.admit(&controller(), &ObjectIdentity::new("wf-1", "1")).await.is_ok());
}

#[tokio::test]
async fn test_commit_rejects_other_uid() {
    let (service, _) = service(100.0, 100);
    let ticket = service.admit(&controller(), &ObjectIdentity::new("wf-1", "1")).await.unwrap();
    let err = ticket.commit(&ObjectIdentity::new("wf-2", "5")).unwrap_err();
    assert!(matches!(err, AdmissionError::UidMismatch { .. }));
    assert!(service.latch().is_empty());
    assert!(service.locks().is_empty());
}

#[tokio::test]
async fn test_ticket_resolves_images_through_cache() {
    let (service, source) = service(100.0, 100);
    let ticket = service.admit(&controller(), &ObjectIdentity::new("wf-1", "1")).await.unwrap();

    assert_eq!(ticket.resolve_image("argoproj/argosay:v2").await.unwrap(), vec!["/argosay"]);
    assert_eq!(ticket.resolve_image("argoproj/argosay:v2").await.unwrap(), vec!["/argosay"]);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    let err = ticket.resolve_image("argoproj/missing:v1").await.unwrap_err();
    assert!(matches!(err, AdmissionError::Image(ImageLookupError::NotFound { .. })));
    assert!(!err.is_retriable());
}
