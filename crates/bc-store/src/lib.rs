//! Durable state for broadcasts: job records and recipient lists.
//!
//! The engine only talks to the [`JobStore`] and [`RecipientDirectory`] traits.
//! [`InMemoryStore`] backs tests and throwaway runs; `SqliteStore` (feature
//! `sqlite`) persists across restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bc_common::{
    BroadcastStats, JobFilter, JobId, JobPage, JobRecord, JobUpdate, ListId, NewJob, RecipientList,
};

pub mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::StoreError;
pub use memory::InMemoryStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable record of broadcast jobs and their aggregate counters
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job with status `pending` and return its id
    async fn create_job(&self, job: NewJob) -> Result<JobId>;

    /// Apply a partial update to an existing job
    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<()>;

    /// Fetch a job, `StoreError::JobNotFound` if unknown
    async fn get_job(&self, id: JobId) -> Result<JobRecord>;

    /// One page of jobs matching `filter`, newest first, with the total
    /// number of matches
    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage<JobRecord>>;

    /// Aggregate over jobs created in `[from, to)`
    async fn stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<BroadcastStats>;
}

/// Lookup of recipient lists by id
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// Fetch a list with all of its recipients (active and inactive)
    async fn get_list(&self, id: ListId) -> Result<RecipientList>;
}
