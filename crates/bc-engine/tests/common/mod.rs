#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use bc_common::{
    BroadcastStats, BroadcastStatusView, JobFilter, JobId, JobPage, JobRecord, JobUpdate, ListId,
    MessageType, NewJob, Recipient,
};
use bc_config::RateLimitStrategy;
use bc_engine::{
    BroadcastEngine, DeliveryError, DeliveryReceipt, EngineConfig, RecipientSink,
};
use bc_store::{InMemoryStore, JobStore, StoreError};

/// Sink recording every send with its (tokio) timestamp
pub struct TestSink {
    ready: AtomicBool,
    failing: HashSet<String>,
    /// Flip to not-ready after this many sends
    ready_for: Option<usize>,
    latency: Duration,
    sends: AtomicUsize,
    pub calls: parking_lot::Mutex<Vec<(String, Instant)>>,
}

impl TestSink {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            failing: HashSet::new(),
            ready_for: None,
            latency: Duration::ZERO,
            sends: AtomicUsize::new(0),
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn failing_for(mut self, recipients: &[&str]) -> Self {
        self.failing = recipients.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn ready_for(mut self, sends: usize) -> Self {
        self.ready_for = Some(sends);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn recipients(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(_, t)| *t).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    async fn record(&self, recipient: &str) -> Result<DeliveryReceipt, DeliveryError> {
        self.calls.lock().push((recipient.to_string(), Instant::now()));
        let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        if self.ready_for.is_some_and(|limit| n >= limit) {
            self.set_ready(false);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.failing.contains(recipient) {
            return Err(DeliveryError::Transport(format!("rejected {}", recipient)));
        }
        Ok(DeliveryReceipt {
            message_id: format!("msg-{}", n),
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl RecipientSink for TestSink {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn send_text(&self, recipient: &str, _text: &str) -> Result<DeliveryReceipt, DeliveryError> {
        self.record(recipient).await
    }

    async fn send_media(
        &self,
        recipient: &str,
        _media_type: MessageType,
        _media_ref: &str,
        _caption: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.record(recipient).await
    }
}

/// Sink that panics on every send after the first `ok_sends`
pub struct PanickingSink {
    ok_sends: usize,
    sends: AtomicUsize,
}

impl PanickingSink {
    pub fn after(ok_sends: usize) -> Self {
        Self {
            ok_sends,
            sends: AtomicUsize::new(0),
        }
    }

    fn send(&self, recipient: &str) -> Result<DeliveryReceipt, DeliveryError> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        if n >= self.ok_sends {
            panic!("transport crashed sending to {}", recipient);
        }
        Ok(DeliveryReceipt {
            message_id: format!("msg-{}", n + 1),
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl RecipientSink for PanickingSink {
    fn is_ready(&self) -> bool {
        true
    }

    async fn send_text(&self, recipient: &str, _text: &str) -> Result<DeliveryReceipt, DeliveryError> {
        self.send(recipient)
    }

    async fn send_media(
        &self,
        recipient: &str,
        _media_type: MessageType,
        _media_ref: &str,
        _caption: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.send(recipient)
    }
}

/// Job store delegating to an in-memory store with injectable failures
pub struct FlakyStore {
    pub inner: Arc<InMemoryStore>,
    /// Fail counter-only updates (progress flushes)
    pub fail_progress: AtomicBool,
    /// Fail promotion to `sending`
    pub fail_promotion: AtomicBool,
    /// Number of final-status updates to fail before succeeding
    pub final_failures: AtomicU32,
    pub updates: parking_lot::Mutex<Vec<JobUpdate>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            fail_progress: AtomicBool::new(false),
            fail_promotion: AtomicBool::new(false),
            final_failures: AtomicU32::new(0),
            updates: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn should_fail(&self, update: &JobUpdate) -> bool {
        let is_progress = update.status.is_none();
        let is_promotion = update.started_at.is_some();
        let is_final = update.completed_at.is_some() && update.sent_count.is_some();

        if is_progress && self.fail_progress.load(Ordering::SeqCst) {
            return true;
        }
        if is_promotion && self.fail_promotion.load(Ordering::SeqCst) {
            return true;
        }
        if is_final {
            return self
                .final_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        }
        false
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_job(&self, job: NewJob) -> bc_store::Result<JobId> {
        self.inner.create_job(job).await
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> bc_store::Result<()> {
        self.updates.lock().push(update.clone());
        if self.should_fail(&update) {
            return Err(StoreError::Database("injected failure".to_string()));
        }
        self.inner.update_job(id, update).await
    }

    async fn get_job(&self, id: JobId) -> bc_store::Result<JobRecord> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> bc_store::Result<JobPage<JobRecord>> {
        self.inner.list_jobs(filter).await
    }

    async fn stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bc_store::Result<BroadcastStats> {
        self.inner.stats(from, to).await
    }
}

pub fn config(rate_limit_per_minute: u32, delay_ms: u64) -> EngineConfig {
    EngineConfig {
        rate_limit_per_minute,
        rate_limit_strategy: RateLimitStrategy::FixedWindow,
        delay: Duration::from_millis(delay_ms),
        max_recipients: 100,
        flush_every: 10,
        finalize_retries: 3,
    }
}

pub fn engine(
    config: EngineConfig,
    store: Arc<InMemoryStore>,
    sink: Arc<TestSink>,
) -> BroadcastEngine {
    BroadcastEngine::new(config, store.clone(), store, sink).unwrap()
}

pub fn seed_list(store: &InMemoryStore, addresses: &[&str]) -> ListId {
    store.create_list(
        "test",
        addresses.iter().map(|a| Recipient::new(*a)).collect(),
    )
}

pub fn seed_numbered(store: &InMemoryStore, count: usize) -> ListId {
    store.create_list(
        "numbered",
        (0..count).map(|i| Recipient::new(format!("r{:03}", i))).collect(),
    )
}

/// Poll until the job has left the registry and its persisted status is terminal
pub async fn wait_for_terminal(engine: &BroadcastEngine, id: JobId) -> BroadcastStatusView {
    loop {
        let view = engine.get_status(id).await.unwrap();
        if view.status.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
