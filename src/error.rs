//! Crate-wide error taxonomy

use thiserror::Error;

/// Error produced by any component of the ingestion pipeline
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid block input: {0}")]
    InvalidBlockInput(String),

    #[error("block not found")]
    NotFound,

    #[error("rpc call timed out")]
    Timeout,

    #[error("upstream rpc error {code}: {message}")]
    Upstream { code: i64, message: String },

    #[error("storage integrity failure: {0}")]
    StorageIntegrity(String),

    #[error("chain {0:?} is not known to the store")]
    UnknownChain(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, IngestError>;

/// Classification of an RPC fetch failure, used to pick a `status.status_code`
/// when writing a `FailureLog` row (§3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    NotFound,
    Timeout,
    Upstream,
    Transport,
}

impl FailureClass {
    /// Status code this failure class is recorded under in the `status` table.
    pub fn status_code(self) -> &'static str {
        match self {
            FailureClass::NotFound => "RPC_NOT_FOUND",
            FailureClass::Timeout => "RPC_TIMEOUT",
            FailureClass::Upstream => "RPC_UPSTREAM_ERROR",
            FailureClass::Transport => "RPC_TRANSPORT_ERROR",
        }
    }
}

impl IngestError {
    /// Classify an error produced while fetching a single block, for FailureLog
    /// purposes. Returns `None` for errors that aren't per-block RPC failures
    /// (e.g. a bug inside the orchestrator itself).
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            IngestError::NotFound => Some(FailureClass::NotFound),
            IngestError::Timeout => Some(FailureClass::Timeout),
            IngestError::Upstream { .. } => Some(FailureClass::Upstream),
            IngestError::Transport(_) | IngestError::Json(_) => Some(FailureClass::Transport),
            _ => None,
        }
    }
}
