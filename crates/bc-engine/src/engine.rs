//! BroadcastEngine - public entry point for creating, observing and
//! cancelling broadcasts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

use bc_common::{
    BroadcastAccepted, BroadcastRequest, BroadcastStats, BroadcastStatus, BroadcastStatusView,
    DailyBroadcastStats, JobFilter, JobId, JobPage, JobUpdate, NewJob,
};
use bc_config::{BroadcastConfig, RateLimitStrategy};
use bc_store::{JobStore, RecipientDirectory, StoreError};
use crate::dispatch::Dispatcher;
use crate::engine_metrics;
use crate::job::{CancelOutcome, DispatchJob};
use crate::rate_limiter::RateLimiter;
use crate::registry::JobRegistry;
use crate::sink::{MessagePayload, RecipientSink};
use crate::{BroadcastError, Result};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Engine settings, usually derived from [`BroadcastConfig`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub rate_limit_per_minute: u32,
    pub rate_limit_strategy: RateLimitStrategy,
    /// Pause between two sends of the same broadcast
    pub delay: Duration,
    pub max_recipients: usize,
    pub flush_every: usize,
    pub finalize_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&BroadcastConfig::default())
    }
}

impl From<&BroadcastConfig> for EngineConfig {
    fn from(config: &BroadcastConfig) -> Self {
        Self {
            rate_limit_per_minute: config.rate_limit_per_minute,
            rate_limit_strategy: config.rate_limit_strategy,
            delay: Duration::from_millis(config.delay_ms),
            max_recipients: config.max_recipients,
            flush_every: config.flush_every,
            finalize_retries: config.finalize_retries,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.max_recipients == 0 {
            return Err(BroadcastError::Config(
                "max recipients must be greater than zero".to_string(),
            ));
        }
        if self.flush_every == 0 {
            return Err(BroadcastError::Config(
                "flush interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct BroadcastEngine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    directory: Arc<dyn RecipientDirectory>,
    sink: Arc<dyn RecipientSink>,

    /// Jobs currently executing, shared with their dispatch tasks
    registry: Arc<JobRegistry>,

    dispatcher: Arc<Dispatcher>,

    /// Cleared by `shutdown`; new broadcasts are refused afterwards
    accepting: AtomicBool,
}

impl BroadcastEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        directory: Arc<dyn RecipientDirectory>,
        sink: Arc<dyn RecipientSink>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_per_minute,
            config.rate_limit_strategy,
        )?);

        let dispatcher = Arc::new(Dispatcher::new(
            sink.clone(),
            store.clone(),
            limiter,
            config.delay,
            config.flush_every,
            config.finalize_retries,
        ));

        info!(
            rate_limit_per_minute = config.rate_limit_per_minute,
            strategy = %config.rate_limit_strategy,
            delay_ms = config.delay.as_millis() as u64,
            max_recipients = config.max_recipients,
            "Broadcast engine created"
        );

        Ok(Self {
            config,
            store,
            directory,
            sink,
            registry: Arc::new(JobRegistry::new()),
            dispatcher,
            accepting: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate the request, persist a job and start dispatching it in the
    /// background. Returns as soon as the dispatch task has been spawned.
    pub async fn create_broadcast(&self, request: BroadcastRequest) -> Result<BroadcastAccepted> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BroadcastError::ShuttingDown);
        }

        if request.message_type.is_media()
            && request.media_ref.as_deref().map_or(true, |r| r.trim().is_empty())
        {
            return Err(BroadcastError::MissingMedia);
        }

        let list = self
            .directory
            .get_list(request.list_id)
            .await
            .map_err(|e| match e {
                StoreError::ListNotFound(id) => BroadcastError::ListNotFound(id),
                other => BroadcastError::Store(other),
            })?;

        if !list.is_active {
            return Err(BroadcastError::InactiveList(list.id));
        }

        let recipients = list.active_addresses();
        if recipients.is_empty() {
            return Err(BroadcastError::NoRecipients);
        }
        if recipients.len() > self.config.max_recipients {
            return Err(BroadcastError::TooManyRecipients {
                count: recipients.len(),
                max: self.config.max_recipients,
            });
        }

        if !self.sink.is_ready() {
            return Err(BroadcastError::TransportNotReady);
        }

        let total = recipients.len() as u32;
        let job_id = self
            .store
            .create_job(NewJob {
                list_id: list.id,
                message_type: request.message_type,
                content: request.content.clone(),
                media_ref: request.media_ref.clone(),
                total_recipients: total,
            })
            .await?;

        let started_at = Utc::now();
        if let Err(e) = self
            .store
            .update_job(
                job_id,
                JobUpdate::status(BroadcastStatus::Sending).with_started_at(started_at),
            )
            .await
        {
            error!(job_id = %job_id, error = %e, "Failed to start broadcast");
            self.mark_failed(job_id).await;
            return Err(e.into());
        }

        let job = Arc::new(DispatchJob::new(
            job_id,
            list.id,
            recipients,
            MessagePayload {
                message_type: request.message_type,
                content: request.content,
                media_ref: request.media_ref,
            },
            started_at,
        ));

        if let Err(e) = self.registry.register(job.clone()) {
            self.mark_failed(job_id).await;
            return Err(e);
        }

        engine_metrics::record_broadcast_started();
        engine_metrics::set_active_broadcasts(self.registry.len());

        let span = info_span!("broadcast", job_id = %job_id, list_id = %list.id);
        let dispatcher = self.dispatcher.clone();
        let registry = self.registry.clone();
        tokio::spawn(
            async move {
                // The loop runs in its own task so a panicking sink cannot
                // leave the job registered
                let run = tokio::spawn({
                    let dispatcher = dispatcher.clone();
                    let job = job.clone();
                    async move { dispatcher.run(&job).await }.in_current_span()
                });
                if let Err(e) = run.await {
                    error!(error = %e, "Dispatch task aborted");
                    dispatcher.abandon(&job).await;
                }
                registry.unregister(job.id);
                engine_metrics::set_active_broadcasts(registry.len());
            }
            .instrument(span),
        );

        info!(
            job_id = %job_id,
            list_id = %list.id,
            total_recipients = total,
            message_type = %request.message_type,
            "Broadcast accepted"
        );

        Ok(BroadcastAccepted {
            job_id,
            total_recipients: total,
            estimated_time: self.config.delay.checked_mul(total).unwrap_or(Duration::MAX),
        })
    }

    /// Live status while the job executes, persisted status afterwards
    pub async fn get_status(&self, id: JobId) -> Result<BroadcastStatusView> {
        if let Some(job) = self.registry.lookup(id) {
            return Ok(job.status_view());
        }

        match self.store.get_job(id).await {
            Ok(record) => Ok(BroadcastStatusView::from(&record)),
            Err(StoreError::JobNotFound(_)) => Err(BroadcastError::JobNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Request cancellation of an executing broadcast.
    ///
    /// The persisted status becomes `cancelled` right away; the dispatch loop
    /// stops at its next iteration boundary. If the last recipient is already
    /// in flight the broadcast still finishes `completed`. Cancelling a job
    /// that already has a pending cancellation is a no-op.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let job = self.registry.lookup(id).ok_or(BroadcastError::NotActive(id))?;

        match job.request_cancel() {
            CancelOutcome::Requested => {
                info!(job_id = %id, attempted = job.attempted(), "Broadcast cancellation requested");
                if let Err(e) = self
                    .store
                    .update_job(id, JobUpdate::status(BroadcastStatus::Cancelled))
                    .await
                {
                    warn!(job_id = %id, error = %e, "Failed to persist cancellation eagerly");
                }
                Ok(())
            }
            CancelOutcome::AlreadyRequested => Ok(()),
            CancelOutcome::Finished => Err(BroadcastError::NotActive(id)),
        }
    }

    /// Status of every executing broadcast
    pub fn list_active(&self) -> Vec<BroadcastStatusView> {
        self.registry
            .list_active()
            .iter()
            .map(|job| job.status_view())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// One page of persisted broadcasts matching `filter`, newest first,
    /// with the total number of matches
    pub async fn history(&self, filter: &JobFilter) -> Result<JobPage<BroadcastStatusView>> {
        let page = self.store.list_jobs(filter).await?;
        Ok(page.map(|record| BroadcastStatusView::from(&record)))
    }

    /// Totals over broadcasts created in `[from, to)`
    pub async fn stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<BroadcastStats> {
        Ok(self.store.stats(from, to).await?)
    }

    /// Per-day totals for the `days` UTC days ending with `last_day`, oldest first
    pub async fn daily_stats(&self, last_day: NaiveDate, days: u32) -> Result<Vec<DailyBroadcastStats>> {
        let mut daily = Vec::with_capacity(days as usize);
        for back in (0..u64::from(days)).rev() {
            let Some(date) = last_day.checked_sub_days(Days::new(back)) else {
                continue;
            };
            let Some(next) = date.succ_opt() else {
                continue;
            };
            let stats = self
                .stats(
                    date.and_time(NaiveTime::MIN).and_utc(),
                    next.and_time(NaiveTime::MIN).and_utc(),
                )
                .await?;
            daily.push(DailyBroadcastStats { date, stats });
        }
        Ok(daily)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting broadcasts, cancel every active one and wait for the
    /// dispatch loops to finalize. Returns false if jobs were still running
    /// when `timeout` expired.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);

        let active = self.registry.list_active();
        info!(active = active.len(), "Shutting down broadcast engine");

        for job in &active {
            if let Err(e) = self.cancel(job.id).await {
                // Finished between the snapshot and the cancel
                info!(job_id = %job.id, error = %e, "Skipped cancelling broadcast");
            }
        }

        let deadline = Instant::now() + timeout;
        while !self.registry.is_empty() {
            if Instant::now() >= deadline {
                warn!(
                    remaining = self.registry.len(),
                    "Shutdown timeout expired with broadcasts still running"
                );
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        info!("Broadcast engine drained");
        true
    }

    async fn mark_failed(&self, id: JobId) {
        let update = JobUpdate::status(BroadcastStatus::Failed).with_completed_at(Utc::now());
        if let Err(e) = self.store.update_job(id, update).await {
            warn!(job_id = %id, error = %e, "Failed to mark broadcast as failed");
        }
    }
}
