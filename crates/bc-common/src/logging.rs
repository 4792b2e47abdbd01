//! Structured logging setup
//!
//! - `LOG_FORMAT=json` selects JSON lines with span context (for log shipping)
//! - anything else selects human-readable text
//! - `RUST_LOG` filters as usual, defaulting to `info`
//!   (e.g. `RUST_LOG=bc_engine=debug` to see every recipient delivery)
//!
//! Dispatch tasks run inside a `broadcast` span carrying `job_id` and `list_id`,
//! so every line a job emits can be correlated without repeating the ids:
//!
//! ```rust,ignore
//! use tracing::{info_span, Instrument};
//!
//! let span = info_span!("broadcast", job_id = %job.id, list_id = %job.list_id);
//! tokio::spawn(async move { dispatcher.run(&job).await }.instrument(span));
//! ```

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format selected from `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Initialize the global subscriber for `service_name`.
///
/// Returns `false` if a subscriber was already installed (e.g. by a test harness).
pub fn init_logging(service_name: &str) -> bool {
    let format = LogFormat::from_env();
    let installed = match format {
        LogFormat::Json => init_json_logging(default_filter()),
        LogFormat::Text => init_text_logging(default_filter()),
    };

    if installed {
        tracing::debug!(service = service_name, ?format, "Logging initialized");
    }
    installed
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_json_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init()
        .is_ok()
}

fn init_text_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(true),
        )
        .try_init()
        .is_ok()
}
