use thiserror::Error;

use crate::types::CampaignStatus;

pub type DispatchResult<T> = Result<T, DispatchError>;
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the campaign control surface.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Campaign {running} is already running")]
    AlreadyRunning { running: i64 },

    #[error("Campaign {0} not found")]
    NotFound(i64),

    #[error("Campaign {0} is already completed")]
    AlreadyCompleted(i64),

    #[error("Campaign {0} has no pending recipients")]
    NoRecipients(i64),

    #[error("Campaign {0} is not running")]
    NotRunning(i64),

    #[error("Campaign {0} is not paused")]
    NotPaused(i64),

    #[error("Invalid campaign: {0}")]
    InvalidCampaign(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("Channel {0} is not connected")]
    ChannelNotReady(String),

    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised by a recipient store implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Recipient {0} already has a terminal status")]
    RecipientAlreadyFinal(i64),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while importing recipients from CSV.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IngestError {
    #[error("CSV input is empty")]
    Empty,

    #[error("No phone column found (expected one of: phone, number, phonenumber)")]
    MissingPhoneColumn,

    #[error("No valid recipient rows ({warnings} rows skipped)")]
    NoValidRows { warnings: usize },
}
