//! Wire/domain types shared across the pipeline.

mod blotter;
mod idempotency;
mod job_status;
mod message;
mod partition_state;
pub mod wire;

pub use blotter::{EnrichmentStatus, ProcessingMetadata, SwapBlotter, WorkflowStatus};
pub use idempotency::{IdempotencyRecord, IdempotencyStatus};
pub use job_status::{JobStatus, JobStatusKind};
pub use message::{
    ManualEntry, PartitionKey, PriceQuantity, Source, TradeCaptureMessage, TradeLot,
};
pub use partition_state::{PartitionState, PositionState};
