use bc_common::{JobId, ListId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Broadcast job not found: {0}")]
    JobNotFound(JobId),

    #[error("Recipient list not found: {0}")]
    ListNotFound(ListId),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
