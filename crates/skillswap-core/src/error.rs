use thiserror::Error;
use uuid::Uuid;

use crate::models::Status;

pub type MarketResult<T> = Result<T, MarketError>;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("sign in to continue")]
    Unauthenticated,

    #[error("not permitted: {0}")]
    Unauthorized(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("{entity} {id} is referenced by active exchanges; resolve them first")]
    HasActiveExchanges { entity: &'static str, id: Uuid },

    #[error("an active swap already exists for this pairing: {existing_swap_id}")]
    DuplicateProposal { existing_swap_id: Uuid },

    #[error("{entity} {id} was changed concurrently; reload and retry")]
    Conflict { entity: &'static str, id: Uuid },

    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("scheduled session index {index} out of range ({len} sessions)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("ledger for user {user_id} does not replay: {detail}")]
    LedgerMismatch { user_id: Uuid, detail: String },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl MarketError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized(reason.into())
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}
