//! The background loop started by `spawn_engine`.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use change_intake::pipeline::spawn_engine;
use change_intake::store::record::{Category, ItemStatus};

use common::*;

#[tokio::test]
async fn shutdown_mid_batch_finishes_the_current_item_only() {
    let h = HarnessBuilder::new(Category::Help, 85).build();
    for i in 0..3 {
        h.transport
            .deliver(message(&format!("m-{i}"), &format!("t-{i}"), &format!("Owner change {i}")));
    }
    let classifier = Arc::clone(&h.classifier);
    let store = Arc::clone(&h.store);

    let (handle, shutdown) = spawn_engine(Arc::new(h.orchestrator));
    // The engine task has not been polled yet on this single-threaded runtime
    classifier.trip.set(Arc::clone(&shutdown)).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("engine did not stop")
        .unwrap();

    assert!(shutdown.load(Ordering::SeqCst));
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    let items = store.all().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, ItemStatus::CompletedSuccess);
}

#[tokio::test]
async fn guardrail_halt_keeps_the_engine_running() {
    let h = HarnessBuilder::new(Category::Help, 85).build();
    for i in 0..21 {
        h.transport
            .deliver(message(&format!("m-{i}"), &format!("t-{i}"), &format!("Bulk {i}")));
    }
    let transport = Arc::clone(&h.transport);
    let store = Arc::clone(&h.store);

    let (handle, shutdown) = spawn_engine(Arc::new(h.orchestrator));

    let alerted = tokio::time::timeout(Duration::from_secs(5), async {
        while transport.sent.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(alerted.is_ok(), "no guardrail alert was sent");
    assert!(!handle.is_finished());
    assert!(store.all().await.unwrap().is_empty());

    shutdown.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("engine did not stop")
        .unwrap();
    assert_eq!(transport.sent.lock().unwrap()[0].0, "oncall@example.com");
}
