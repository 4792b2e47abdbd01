//! Global send-rate gate shared by every dispatch loop of an engine.
//!
//! Two strategies are available:
//! - `FixedWindow`: counts acquisitions since the window started; once the
//!   count reaches the limit, the caller is suspended until the window ends
//!   and a new window begins. Waiters are admitted first-come-first-served.
//! - `Smooth`: governor GCRA quota with a burst of one, spacing acquisitions
//!   evenly at `60s / limit`.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota};
use nonzero_ext::nonzero;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use bc_config::RateLimitStrategy;
use crate::engine_metrics;
use crate::{BroadcastError, Result};

const WINDOW: Duration = Duration::from_secs(60);

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct WindowState {
    count: u32,
    window_start: Instant,
}

enum Gate {
    FixedWindow(Mutex<WindowState>),
    Smooth(DirectLimiter),
}

pub struct RateLimiter {
    limit: u32,
    gate: Gate,
}

impl RateLimiter {
    /// Create a limiter admitting `limit_per_minute` acquisitions per 60s.
    /// A zero limit is a configuration error.
    pub fn new(limit_per_minute: u32, strategy: RateLimitStrategy) -> Result<Self> {
        let limit = NonZeroU32::new(limit_per_minute).ok_or_else(|| {
            BroadcastError::Config("rate limit per minute must be greater than zero".to_string())
        })?;

        let gate = match strategy {
            RateLimitStrategy::FixedWindow => Gate::FixedWindow(Mutex::new(WindowState {
                count: 0,
                window_start: Instant::now(),
            })),
            RateLimitStrategy::Smooth => {
                let quota = Quota::with_period(WINDOW / limit.get())
                    .ok_or_else(|| {
                        BroadcastError::Config(format!(
                            "rate limit {} per minute is too high for smooth pacing",
                            limit
                        ))
                    })?
                    .allow_burst(nonzero!(1u32));
                Gate::Smooth(DirectLimiter::direct(quota))
            }
        };

        Ok(Self {
            limit: limit.get(),
            gate,
        })
    }

    pub fn fixed_window(limit_per_minute: u32) -> Result<Self> {
        Self::new(limit_per_minute, RateLimitStrategy::FixedWindow)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn strategy(&self) -> RateLimitStrategy {
        match self.gate {
            Gate::FixedWindow(_) => RateLimitStrategy::FixedWindow,
            Gate::Smooth(_) => RateLimitStrategy::Smooth,
        }
    }

    /// Wait for capacity. Never fails and never skips; returns whether the
    /// caller had to wait.
    pub async fn acquire(&self) -> bool {
        match &self.gate {
            Gate::FixedWindow(state) => self.acquire_fixed(state).await,
            Gate::Smooth(limiter) => {
                if limiter.check().is_ok() {
                    return false;
                }
                engine_metrics::record_rate_limit_wait();
                limiter.until_ready().await;
                true
            }
        }
    }

    async fn acquire_fixed(&self, state: &Mutex<WindowState>) -> bool {
        // The lock is held across the sleep so later callers queue behind it
        let mut state = state.lock().await;
        let mut waited = false;

        if state.window_start.elapsed() >= WINDOW {
            state.count = 0;
            state.window_start = Instant::now();
        }

        if state.count >= self.limit {
            let resume_at = state.window_start + WINDOW;
            debug!(
                limit = self.limit,
                wait_ms = resume_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Rate limit reached, waiting for next window"
            );
            engine_metrics::record_rate_limit_wait();
            tokio::time::sleep_until(resume_at).await;
            state.count = 0;
            state.window_start = Instant::now();
            waited = true;
        }

        state.count += 1;
        waited
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("strategy", &self.strategy())
            .finish()
    }
}
