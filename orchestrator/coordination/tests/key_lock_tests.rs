// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use reconcile_gate_coordination::domain::KeyLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_hundred_tasks_increment_under_one_key() {
    let locks: KeyLock<String> = KeyLock::new();
    let counter = Arc::new(Mutex::new(0u64));
    let holders = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let locks = locks.clone();
            let counter = Arc::clone(&counter);
            let holders = Arc::clone(&holders);
            tokio::spawn(async move {
                let guard = locks.lock("workflow-uid".to_string()).await;
                assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0, "two tasks inside the critical section");

                // Read, yield, write: loses updates unless exclusion holds.
                let seen = *counter.lock().unwrap();
                tokio::task::yield_now().await;
                *counter.lock().unwrap() = seen + 1;

                holders.fetch_sub(1, Ordering::SeqCst);
                drop(guard);
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    assert_eq!(*counter.lock().unwrap(), 100);
    assert!(locks.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_do_not_block() {
    let locks: KeyLock<u32> = KeyLock::new();
    let _a = locks.lock(1).await;

    let other = tokio::time::timeout(Duration::from_millis(100), locks.lock(2)).await;
    assert!(other.is_ok());
    assert_eq!(locks.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_map_drains_after_contention_on_many_keys() {
    let locks: KeyLock<u32> = KeyLock::new();

    let tasks: Vec<_> = (0..200u32)
        .map(|i| {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(i % 7).await;
                tokio::task::yield_now().await;
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }
    assert_eq!(locks.len(), 0);
}

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() {
    let locks: KeyLock<&'static str> = KeyLock::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let first = locks.lock("k").await;

    let mut waiters = Vec::new();
    for i in 0..5 {
        let locks = locks.clone();
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            let _guard = locks.lock("k").await;
            order.lock().unwrap().push(i);
        }));
        // Let the waiter enqueue before spawning the next.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    drop(first);
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert!(locks.is_empty());
}
