use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub mod logging;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a persisted broadcast job. Assigned by the job store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a recipient list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListId(pub i64);

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Message & Status Enums
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown message type: {0}")]
pub struct UnknownMessageType(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown broadcast status: {0}")]
pub struct UnknownStatus(pub String);

/// Kind of payload a broadcast delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Document,
    Audio,
    Video,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    /// Media messages carry a media reference and use the content as caption.
    pub fn is_media(&self) -> bool {
        !matches!(self, Self::Text)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "document" => Ok(Self::Document),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            _ => Err(UnknownMessageType(s.to_string())),
        }
    }
}

/// Broadcast job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStatus {
    /// Job persisted, dispatch not started yet
    Pending,
    /// Dispatch loop running
    Sending,
    /// Every recipient attempted
    Completed,
    /// Rejected before dispatch started
    Failed,
    /// Stopped by a cancellation request
    Cancelled,
}

impl Default for BroadcastStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BroadcastStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

// ============================================================================
// Recipient Lists
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    /// Transport address (contact or group identifier)
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    pub is_active: bool,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            is_active: true,
        }
    }

    pub fn inactive(address: impl Into<String>) -> Self {
        Self {
            is_active: false,
            ..Self::new(address)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientList {
    pub id: ListId,
    pub name: String,
    pub is_active: bool,
    pub recipients: Vec<Recipient>,
}

impl RecipientList {
    /// Addresses of active recipients, in list order.
    pub fn active_addresses(&self) -> Vec<String> {
        self.recipients
            .iter()
            .filter(|r| r.is_active)
            .map(|r| r.address.clone())
            .collect()
    }
}

// ============================================================================
// Broadcast Requests & Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub list_id: ListId,
    pub message_type: MessageType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
}

impl BroadcastRequest {
    pub fn text(list_id: ListId, content: impl Into<String>) -> Self {
        Self {
            list_id,
            message_type: MessageType::Text,
            content: content.into(),
            media_ref: None,
        }
    }

    pub fn media(
        list_id: ListId,
        message_type: MessageType,
        media_ref: impl Into<String>,
        caption: impl Into<String>,
    ) -> Self {
        Self {
            list_id,
            message_type,
            content: caption.into(),
            media_ref: Some(media_ref.into()),
        }
    }
}

/// Returned once a broadcast has been accepted and dispatch has started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastAccepted {
    pub job_id: JobId,
    pub total_recipients: u32,
    /// Upper bound from the inter-message delay; ignores rate-limit pauses
    #[serde(rename = "estimated_time_ms", with = "duration_ms")]
    pub estimated_time: Duration,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ============================================================================
// Persisted Jobs
// ============================================================================

/// Job description handed to the store at creation time.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub list_id: ListId,
    pub message_type: MessageType,
    pub content: String,
    pub media_ref: Option<String>,
    pub total_recipients: u32,
}

/// Durable view of a broadcast job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub list_id: ListId,
    pub message_type: MessageType,
    pub content: String,
    pub media_ref: Option<String>,
    pub status: BroadcastStatus,
    pub sent_count: u32,
    pub failed_count: u32,
    pub total_recipients: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn from_new(id: JobId, job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            list_id: job.list_id,
            message_type: job.message_type,
            content: job.content,
            media_ref: job.media_ref,
            status: BroadcastStatus::Pending,
            sent_count: 0,
            failed_count: 0,
            total_recipients: job.total_recipients,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update. Timestamps already set are never overwritten.
    pub fn apply(&mut self, update: &JobUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(sent) = update.sent_count {
            self.sent_count = sent;
        }
        if let Some(failed) = update.failed_count {
            self.failed_count = failed;
        }
        if self.started_at.is_none() {
            self.started_at = update.started_at;
        }
        if self.completed_at.is_none() {
            self.completed_at = update.completed_at;
        }
        self.updated_at = now;
    }
}

/// Partial update of a persisted job. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<BroadcastStatus>,
    pub sent_count: Option<u32>,
    pub failed_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn status(status: BroadcastStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn counters(sent: u32, failed: u32) -> Self {
        Self::default().with_counters(sent, failed)
    }

    pub fn with_counters(mut self, sent: u32, failed: u32) -> Self {
        self.sent_count = Some(sent);
        self.failed_count = Some(failed);
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

/// Filter for broadcast history queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    pub status: Option<BroadcastStatus>,
    pub list_id: Option<ListId>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            list_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub fn with_status(mut self, status: BroadcastStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_list(mut self, list_id: ListId) -> Self {
        self.list_id = Some(list_id);
        self
    }

    pub fn with_page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Whether `record` passes the status and list filters (paging aside)
    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.map_or(true, |s| s == record.status)
            && self.list_id.map_or(true, |l| l == record.list_id)
    }
}

/// One page of a history query plus the number of matching jobs overall
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

impl<T> JobPage<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> JobPage<U> {
        JobPage {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Aggregate counts over the broadcasts created in some period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Sum of `sent_count` over the period's broadcasts
    pub total_sent: u64,
    /// Sum of `failed_count` over the period's broadcasts
    pub total_failed: u64,
}

impl BroadcastStats {
    pub fn add(&mut self, record: &JobRecord) {
        self.total += 1;
        match record.status {
            BroadcastStatus::Completed => self.completed += 1,
            BroadcastStatus::Failed => self.failed += 1,
            BroadcastStatus::Cancelled => self.cancelled += 1,
            BroadcastStatus::Pending | BroadcastStatus::Sending => {}
        }
        self.total_sent += u64::from(record.sent_count);
        self.total_failed += u64::from(record.failed_count);
    }
}

/// Statistics for one UTC calendar day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBroadcastStats {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub stats: BroadcastStats,
}

// ============================================================================
// Status Views
// ============================================================================

/// Point-in-time status of a broadcast, from either the live job or the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastStatusView {
    pub id: JobId,
    pub list_id: ListId,
    pub status: BroadcastStatus,
    pub sent_count: u32,
    pub failed_count: u32,
    pub total_recipients: u32,
    pub progress: f64,
    /// Set while a cancelled job is still winding down
    #[serde(default)]
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&JobRecord> for BroadcastStatusView {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id,
            list_id: record.list_id,
            status: record.status,
            sent_count: record.sent_count,
            failed_count: record.failed_count,
            total_recipients: record.total_recipients,
            progress: progress_percent(record.sent_count, record.failed_count, record.total_recipients),
            cancel_requested: false,
            started_at: record.started_at,
            completed_at: record.completed_at,
            created_at: Some(record.created_at),
        }
    }
}

/// Percentage of recipients attempted. Zero when there are no recipients.
pub fn progress_percent(sent: u32, failed: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (sent as f64 + failed as f64) / total as f64 * 100.0
}
