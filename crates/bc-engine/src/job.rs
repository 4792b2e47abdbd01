use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use bc_common::{progress_percent, BroadcastStatus, BroadcastStatusView, JobId, ListId};
use crate::sink::MessagePayload;

const RUNNING: u8 = 0;
const CANCEL_REQUESTED: u8 = 1;
const FINISHED: u8 = 2;

/// Outcome of raising the cancellation signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// This call raised the signal
    Requested,
    /// The signal had already been raised
    AlreadyRequested,
    /// The loop has already finalized
    Finished,
}

/// In-memory state of one executing broadcast.
///
/// Counters are written only by the owning dispatch loop and read
/// concurrently by status queries.
#[derive(Debug)]
pub struct DispatchJob {
    pub id: JobId,
    pub list_id: ListId,
    pub payload: MessagePayload,
    recipients: Vec<String>,
    sent: AtomicU32,
    failed: AtomicU32,
    state: AtomicU8,
    cancel_notify: Notify,
    pub started_at: DateTime<Utc>,
}

impl DispatchJob {
    pub fn new(
        id: JobId,
        list_id: ListId,
        recipients: Vec<String>,
        payload: MessagePayload,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            list_id,
            payload,
            recipients,
            sent: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            state: AtomicU8::new(RUNNING),
            cancel_notify: Notify::new(),
            started_at,
        }
    }

    /// Recipients in dispatch order
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn total(&self) -> u32 {
        self.recipients.len() as u32
    }

    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn attempted(&self) -> u32 {
        self.sent() + self.failed()
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    /// Raise the cancellation signal. Non-blocking and idempotent.
    pub fn request_cancel(&self) -> CancelOutcome {
        match self
            .state
            .compare_exchange(RUNNING, CANCEL_REQUESTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.cancel_notify.notify_one();
                CancelOutcome::Requested
            }
            Err(CANCEL_REQUESTED) => CancelOutcome::AlreadyRequested,
            Err(_) => CancelOutcome::Finished,
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCEL_REQUESTED
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        if self.is_cancel_requested() {
            return;
        }
        self.cancel_notify.notified().await;
    }

    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) == FINISHED
    }

    /// Close the job to further cancellation. Returns whether a cancel was
    /// requested before the job finished.
    pub(crate) fn finish(&self) -> bool {
        self.state.swap(FINISHED, Ordering::AcqRel) == CANCEL_REQUESTED
    }

    /// Live status view. Counters may lag each other by one attempt.
    pub fn status_view(&self) -> BroadcastStatusView {
        let sent = self.sent();
        let failed = self.failed();
        let total = self.total();
        BroadcastStatusView {
            id: self.id,
            list_id: self.list_id,
            status: BroadcastStatus::Sending,
            sent_count: sent,
            failed_count: failed,
            total_recipients: total,
            progress: progress_percent(sent, failed, total),
            cancel_requested: self.is_cancel_requested(),
            started_at: Some(self.started_at),
            completed_at: None,
            created_at: None,
        }
    }
}
