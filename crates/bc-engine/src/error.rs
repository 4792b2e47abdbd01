use bc_common::{JobId, ListId};
use bc_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("Recipient list not found: {0}")]
    ListNotFound(ListId),

    #[error("Recipient list is inactive: {0}")]
    InactiveList(ListId),

    #[error("Recipient list has no active recipients")]
    NoRecipients,

    #[error("Too many recipients: {count} exceeds the limit of {max}")]
    TooManyRecipients { count: usize, max: usize },

    #[error("Media messages require a media reference")]
    MissingMedia,

    #[error("Transport is not ready")]
    TransportNotReady,

    #[error("Broadcast job not found: {0}")]
    JobNotFound(JobId),

    #[error("Broadcast is not active: {0}")]
    NotActive(JobId),

    #[error("Broadcast already registered: {0}")]
    AlreadyRegistered(JobId),

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl BroadcastError {
    /// Errors raised while validating a request, before any job exists
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::ListNotFound(_)
                | Self::InactiveList(_)
                | Self::NoRecipients
                | Self::TooManyRecipients { .. }
                | Self::MissingMedia
        )
    }
}
