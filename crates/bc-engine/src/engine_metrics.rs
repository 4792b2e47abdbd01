//! Metrics for the broadcast engine
//!
//! Recorded through the `metrics` facade; the embedding process decides
//! whether and how to export them.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use bc_common::BroadcastStatus;

/// Record a delivery attempt outcome
pub fn record_delivery(success: bool, duration: Duration) {
    if success {
        counter!("bc_messages_sent_total").increment(1);
    } else {
        counter!("bc_messages_failed_total").increment(1);
    }
    histogram!(
        "bc_delivery_duration_seconds",
        "success" => success.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a recipient skipped because the transport was not ready
pub fn record_not_ready_skip() {
    counter!("bc_messages_failed_total").increment(1);
    counter!("bc_transport_not_ready_total").increment(1);
}

/// Record a broadcast whose dispatch loop has started
pub fn record_broadcast_started() {
    counter!("bc_broadcasts_started_total").increment(1);
}

/// Record a broadcast reaching a terminal status
pub fn record_broadcast_finished(status: BroadcastStatus) {
    counter!(
        "bc_broadcasts_finished_total",
        "status" => status.as_str()
    )
    .increment(1);
}

/// Record an acquisition that had to wait for rate limit capacity
pub fn record_rate_limit_wait() {
    counter!("bc_rate_limit_waits_total").increment(1);
}

/// Record a failed progress flush
pub fn record_progress_flush_failure() {
    counter!("bc_progress_flush_failures_total").increment(1);
}

/// Update the number of executing broadcasts
pub fn set_active_broadcasts(count: usize) {
    gauge!("bc_active_broadcasts").set(count as f64);
}
