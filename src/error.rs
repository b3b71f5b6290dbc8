//! Crate-wide error taxonomy.
//!
//! Leaf errors live beside the module that raises them and are folded into
//! [`CoreError`] with `#[from]`.

use thiserror::Error;

use crate::model::PartitionKey;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<ValidationIssue>),

    #[error("duplicate trade for idempotency key {0}")]
    DuplicateTrade(String),

    #[error("rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("partition lock acquisition timed out for {0}")]
    LockAcquisitionTimeout(PartitionKey),

    #[error("sequence {sequence} too old for partition {partition} (last processed {last_processed})")]
    SequenceOutOfOrderTooOld {
        partition: PartitionKey,
        sequence: u64,
        last_processed: u64,
    },

    #[error("sequence {sequence} gap too large for partition {partition} (last processed {last_processed})")]
    SequenceGapTooLarge {
        partition: PartitionKey,
        sequence: u64,
        last_processed: u64,
    },

    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("transient broker error: {0}")]
    TransientBroker(String),

    #[error("deadlock detected, retries exhausted: {0}")]
    Deadlock(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("workflow pending approval")]
    WorkflowPending,

    #[error("workflow rejected: {0}")]
    WorkflowRejected(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("optimistic concurrency conflict on {0}")]
    VersionConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error detail surfaced to callers alongside any non-`SUCCESS` outcome:
/// a stable code, a human-readable message, and the time it occurred.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorDetail {
    pub fn from_core_error(err: &CoreError) -> Self {
        Self {
            code: error_code(err).to_string(),
            message: err.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }
}

fn error_code(err: &CoreError) -> &'static str {
    match err {
        CoreError::Validation(_) => "VALIDATION_FAILED",
        CoreError::DuplicateTrade(_) => "DUPLICATE_TRADE",
        CoreError::RateLimited(_) => "RATE_LIMIT_EXCEEDED",
        CoreError::LockAcquisitionTimeout(_) => "LOCK_ACQUISITION_FAILED",
        CoreError::SequenceOutOfOrderTooOld { .. } => "OUT_OF_ORDER_TOO_OLD",
        CoreError::SequenceGapTooLarge { .. } => "GAP_TOO_LARGE",
        CoreError::TransientStore(_) => "TRANSIENT_STORE_ERROR",
        CoreError::TransientBroker(_) => "TRANSIENT_BROKER_ERROR",
        CoreError::Deadlock(_) => "DEADLOCK",
        CoreError::CircuitOpen(_) => "CIRCUIT_OPEN",
        CoreError::WorkflowPending => "PENDING_APPROVAL",
        CoreError::WorkflowRejected(_) => "REJECTED",
        CoreError::Publish(_) => "PUBLISH_FAILURE",
        CoreError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
        CoreError::VersionConflict(_) => "VERSION_CONFLICT",
        CoreError::NotFound(_) => "NOT_FOUND",
        CoreError::FatalConfig(_) => "FATAL_CONFIG_ERROR",
        CoreError::Internal(_) => "PROCESSING_ERROR",
    }
}
