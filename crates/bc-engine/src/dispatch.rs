//! Dispatch loop: sequential, paced delivery of one broadcast.
//!
//! Recipients are attempted strictly in list order. Each attempt passes the
//! shared rate limiter first; a per-recipient failure is counted and the loop
//! moves on. Progress counters are flushed to the store periodically and
//! always at the end. Cancellation is observed between attempts, never in
//! the middle of a send; a cancel that arrives once the last recipient is
//! already in flight leaves the broadcast `completed`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use bc_common::{BroadcastStatus, JobUpdate};
use bc_store::JobStore;
use crate::engine_metrics;
use crate::job::DispatchJob;
use crate::rate_limiter::RateLimiter;
use crate::sink::{deliver, RecipientSink};

const FINALIZE_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Runs dispatch loops. Shared by every job of an engine.
pub struct Dispatcher {
    sink: Arc<dyn RecipientSink>,
    store: Arc<dyn JobStore>,
    limiter: Arc<RateLimiter>,
    delay: Duration,
    flush_every: usize,
    finalize_retries: u32,
}

impl Dispatcher {
    pub fn new(
        sink: Arc<dyn RecipientSink>,
        store: Arc<dyn JobStore>,
        limiter: Arc<RateLimiter>,
        delay: Duration,
        flush_every: usize,
        finalize_retries: u32,
    ) -> Self {
        Self {
            sink,
            store,
            limiter,
            delay,
            flush_every: flush_every.max(1),
            finalize_retries: finalize_retries.max(1),
        }
    }

    /// Attempt every recipient of `job` and persist its final status
    pub async fn run(&self, job: &DispatchJob) -> BroadcastStatus {
        let total = job.recipients().len();
        info!(total_recipients = total, "Dispatch started");

        let mut since_flush = 0usize;

        for (index, recipient) in job.recipients().iter().enumerate() {
            if job.is_cancel_requested() {
                info!(attempted = job.attempted(), "Cancellation observed, stopping dispatch");
                break;
            }

            let last = index + 1 == total;

            if self.sink.is_ready() {
                // Waiting for capacity can take up to a full window
                tokio::select! {
                    biased;
                    _ = job.cancelled() => {
                        info!(attempted = job.attempted(), "Cancelled while waiting for rate limit");
                        break;
                    }
                    _ = self.limiter.acquire() => {}
                }
                self.attempt(job, recipient).await;
            } else {
                job.record_failed();
                engine_metrics::record_not_ready_skip();
                warn!(recipient = %recipient, "Transport not ready, recipient counted as failed");
            }

            since_flush += 1;
            if last || since_flush >= self.flush_every {
                self.flush_progress(job).await;
                since_flush = 0;
            }

            if !last && !self.delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = job.cancelled() => {}
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
        }

        self.finalize(job).await
    }

    async fn attempt(&self, job: &DispatchJob, recipient: &str) {
        let started = Instant::now();
        match deliver(self.sink.as_ref(), recipient, &job.payload).await {
            Ok(receipt) => {
                job.record_sent();
                engine_metrics::record_delivery(true, started.elapsed());
                debug!(
                    recipient = %recipient,
                    message_id = %receipt.message_id,
                    "Message delivered"
                );
            }
            Err(e) => {
                job.record_failed();
                engine_metrics::record_delivery(false, started.elapsed());
                warn!(recipient = %recipient, error = %e, "Delivery failed");
            }
        }
    }

    async fn flush_progress(&self, job: &DispatchJob) {
        let update = JobUpdate::counters(job.sent(), job.failed());
        if let Err(e) = self.store.update_job(job.id, update).await {
            engine_metrics::record_progress_flush_failure();
            warn!(
                sent = job.sent(),
                failed = job.failed(),
                error = %e,
                "Failed to persist broadcast progress"
            );
        }
    }

    async fn finalize(&self, job: &DispatchJob) -> BroadcastStatus {
        // A cancel only counts if it actually left recipients unattempted
        let cancel_requested = job.finish();
        let status = if cancel_requested && job.attempted() < job.total() {
            BroadcastStatus::Cancelled
        } else {
            BroadcastStatus::Completed
        };

        self.persist_final(job, status).await;
        info!(
            status = %status,
            sent = job.sent(),
            failed = job.failed(),
            total_recipients = job.total(),
            "Dispatch finished"
        );
        status
    }

    /// Close a job whose dispatch loop died before finalizing
    pub async fn abandon(&self, job: &DispatchJob) {
        job.finish();
        self.persist_final(job, BroadcastStatus::Failed).await;
        warn!(
            sent = job.sent(),
            failed = job.failed(),
            total_recipients = job.total(),
            "Dispatch abandoned, broadcast marked failed"
        );
    }

    async fn persist_final(&self, job: &DispatchJob, status: BroadcastStatus) {
        let update = JobUpdate::status(status)
            .with_counters(job.sent(), job.failed())
            .with_completed_at(Utc::now());

        let mut backoff = FINALIZE_INITIAL_BACKOFF;
        for attempt in 1..=self.finalize_retries {
            match self.store.update_job(job.id, update.clone()).await {
                Ok(()) => break,
                Err(e) if attempt < self.finalize_retries => {
                    warn!(
                        attempt,
                        retry_in_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Failed to persist final broadcast status, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(
                        attempts = attempt,
                        status = %status,
                        error = %e,
                        "Giving up persisting final broadcast status"
                    );
                }
            }
        }

        engine_metrics::record_broadcast_finished(status);
    }
}
