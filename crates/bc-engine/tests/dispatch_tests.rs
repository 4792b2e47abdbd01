//! Dispatch Loop Tests
//!
//! Tests for:
//! - Per-recipient failure isolation
//! - Recipient ordering
//! - Transport becoming not-ready mid-dispatch
//! - Progress flush cadence and flush failures
//! - Final status persistence retries
//! - A panicking transport releasing its job

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bc_common::{BroadcastRequest, BroadcastStatus, MessageType};
use bc_engine::{BroadcastEngine, BroadcastError};
use bc_store::{InMemoryStore, JobStore};
use common::*;

#[tokio::test(start_paused = true)]
async fn test_failed_recipient_does_not_abort_job() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(TestSink::new().failing_for(&["B"]));
    let engine = engine(config(100, 1000), store.clone(), sink.clone());
    let list = seed_list(&store, &["A", "B", "C"]);

    let accepted = engine
        .create_broadcast(BroadcastRequest::text(list, "hello"))
        .await
        .unwrap();
    assert_eq!(accepted.total_recipients, 3);

    let view = wait_for_terminal(&engine, accepted.job_id).await;
    assert_eq!(view.status, BroadcastStatus::Completed);
    assert_eq!(view.sent_count, 2);
    assert_eq!(view.failed_count, 1);
    assert_eq!(view.progress, 100.0);
    assert!(view.completed_at.is_some());

    assert_eq!(sink.recipients(), vec!["A", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_recipients_attempted_in_list_order_with_delay() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(TestSink::new());
    let engine = engine(config(100, 1000), store.clone(), sink.clone());
    let list = seed_list(&store, &["d", "a", "c", "b"]);

    let accepted = engine
        .create_broadcast(BroadcastRequest::text(list, "ordered"))
        .await
        .unwrap();
    wait_for_terminal(&engine, accepted.job_id).await;

    assert_eq!(sink.recipients(), vec!["d", "a", "c", "b"]);

    let times = sink.times();
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= std::time::Duration::from_millis(1000));
    }
}

#[tokio::test(start_paused = true)]
async fn test_media_broadcast_delivered() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(TestSink::new());
    let engine = engine(config(100, 0), store.clone(), sink.clone());
    let list = seed_list(&store, &["a", "b"]);

    let accepted = engine
        .create_broadcast(BroadcastRequest::media(
            list,
            MessageType::Document,
            "https://cdn.example/report.pdf",
            "Q3 report",
        ))
        .await
        .unwrap();

    let view = wait_for_terminal(&engine, accepted.job_id).await;
    assert_eq!(view.sent_count, 2);

    let record = store.get_job(accepted.job_id).await.unwrap();
    assert_eq!(record.message_type, MessageType::Document);
    assert_eq!(record.media_ref.as_deref(), Some("https://cdn.example/report.pdf"));
}

#[tokio::test(start_paused = true)]
async fn test_not_ready_mid_dispatch_counts_failures() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(TestSink::new().ready_for(2));
    let engine = engine(config(100, 500), store.clone(), sink.clone());
    let list = seed_list(&store, &["a", "b", "c", "d", "e"]);

    let accepted = engine
        .create_broadcast(BroadcastRequest::text(list, "hi"))
        .await
        .unwrap();
    let view = wait_for_terminal(&engine, accepted.job_id).await;

    assert_eq!(view.status, BroadcastStatus::Completed);
    assert_eq!(view.sent_count, 2);
    assert_eq!(view.failed_count, 3);
    // Not-ready recipients never reach the transport
    assert_eq!(sink.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_counters_never_exceed_total() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(TestSink::new().failing_for(&["r003", "r007"]));
    let engine = engine(config(100, 250), store.clone(), sink.clone());
    let list = seed_numbered(&store, 12);

    let accepted = engine
        .create_broadcast(BroadcastRequest::text(list, "hi"))
        .await
        .unwrap();

    loop {
        let view = engine.get_status(accepted.job_id).await.unwrap();
        assert!(view.sent_count + view.failed_count <= view.total_recipients);
        if view.status.is_terminal() {
            assert_eq!(view.sent_count + view.failed_count, view.total_recipients);
            assert_eq!((view.sent_count, view.failed_count), (10, 2));
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_progress_flushed_every_n_and_at_end() {
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(FlakyStore::new(inner.clone()));
    let sink = Arc::new(TestSink::new());
    let mut cfg = config(100, 0);
    cfg.flush_every = 3;
    let engine = BroadcastEngine::new(cfg, store.clone(), inner.clone(), sink).unwrap();
    let list = seed_numbered(&inner, 7);

    let accepted = engine
        .create_broadcast(BroadcastRequest::text(list, "hi"))
        .await
        .unwrap();
    wait_for_terminal(&engine, accepted.job_id).await;

    let progress: Vec<u32> = store
        .updates
        .lock()
        .iter()
        .filter(|u| u.status.is_none())
        .filter_map(|u| u.sent_count)
        .collect();
    assert_eq!(progress, vec![3, 6, 7]);
}

#[tokio::test(start_paused = true)]
async fn test_flush_failure_does_not_stop_dispatch() {
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(FlakyStore::new(inner.clone()));
    store.fail_progress.store(true, Ordering::SeqCst);
    let sink = Arc::new(TestSink::new());
    let mut cfg = config(100, 100);
    cfg.flush_every = 1;
    let engine = BroadcastEngine::new(cfg, store.clone(), inner.clone(), sink.clone()).unwrap();
    let list = seed_numbered(&inner, 4);

    let accepted = engine
        .create_broadcast(BroadcastRequest::text(list, "hi"))
        .await
        .unwrap();
    let view = wait_for_terminal(&engine, accepted.job_id).await;

    assert_eq!(sink.call_count(), 4);
    assert_eq!(view.status, BroadcastStatus::Completed);
    // Final persistence carries the counters even though every flush failed
    assert_eq!(view.sent_count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_final_status_persistence_is_retried() {
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(FlakyStore::new(inner.clone()));
    store.final_failures.store(2, Ordering::SeqCst);
    let sink = Arc::new(TestSink::new());
    let engine = BroadcastEngine::new(config(100, 0), store.clone(), inner.clone(), sink).unwrap();
    let list = seed_list(&inner, &["a", "b"]);

    let accepted = engine
        .create_broadcast(BroadcastRequest::text(list, "hi"))
        .await
        .unwrap();
    let view = wait_for_terminal(&engine, accepted.job_id).await;

    assert_eq!(view.status, BroadcastStatus::Completed);
    assert_eq!(store.final_failures.load(Ordering::SeqCst), 0);
    let finals = store
        .updates
        .lock()
        .iter()
        .filter(|u| u.status == Some(BroadcastStatus::Completed))
        .count();
    assert_eq!(finals, 3);
}

#[tokio::test(start_paused = true)]
async fn test_promotion_failure_marks_job_failed() {
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(FlakyStore::new(inner.clone()));
    store.fail_promotion.store(true, Ordering::SeqCst);
    let sink = Arc::new(TestSink::new());
    let engine = BroadcastEngine::new(config(100, 0), store.clone(), inner.clone(), sink.clone()).unwrap();
    let list = seed_list(&inner, &["a"]);

    let result = engine
        .create_broadcast(BroadcastRequest::text(list, "hi"))
        .await;
    assert!(matches!(result, Err(BroadcastError::Store(_))));

    assert_eq!(inner.job_count(), 1);
    let record = inner.list_jobs(&Default::default()).await.unwrap().items.remove(0);
    assert_eq!(record.status, BroadcastStatus::Failed);
    assert_eq!(engine.active_count(), 0);
    assert_eq!(sink.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_sink_releases_job() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(PanickingSink::after(1));
    let engine = BroadcastEngine::new(config(100, 0), store.clone(), store.clone(), sink).unwrap();
    let list = seed_list(&store, &["a", "b", "c"]);

    let accepted = engine
        .create_broadcast(BroadcastRequest::text(list, "hi"))
        .await
        .unwrap();

    let view = wait_for_terminal(&engine, accepted.job_id).await;
    assert_eq!(view.status, BroadcastStatus::Failed);
    assert_eq!(view.sent_count, 1);
    assert!(view.completed_at.is_some());

    assert_eq!(engine.active_count(), 0);
    assert!(engine.list_active().is_empty());
    assert!(matches!(
        engine.cancel(accepted.job_id).await,
        Err(BroadcastError::NotActive(_))
    ));
    assert!(engine.shutdown(Duration::from_secs(1)).await);

    let record = store.get_job(accepted.job_id).await.unwrap();
    assert_eq!(record.status, BroadcastStatus::Failed);
}
