//! Error taxonomy for the orchestration core.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("DeltaFile {0} not found")]
    NotFound(Uuid),

    #[error("unexpected action {action} for DeltaFile {did}; pending: {pending:?}")]
    UnexpectedAction {
        did: Uuid,
        action: String,
        pending: Vec<String>,
    },

    #[error("no egress flow configured for DeltaFile {0}")]
    MissingEgressFlow(Uuid),

    #[error("invalid split on DeltaFile {did}: {reason}")]
    InvalidSplit { did: Uuid, reason: String },

    #[error("content for DeltaFile {did} was deleted ({reason})")]
    ContentGone { did: Uuid, reason: String },

    #[error("optimistic lock conflict on DeltaFile {0}")]
    OptimisticConflict(Uuid),

    #[error("queue backend unavailable: {0}")]
    QueueUnavailable(String),

    #[error("timed out acquiring join entry lock for {0}")]
    JoinTimeout(String),

    #[error("flow {0} is not running")]
    MissingFlow(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
