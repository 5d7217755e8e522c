//! Durable background-job infrastructure.
//!
//! ```text
//! scheduler / HTTP enqueue
//!     │
//!     └─► JobStore.enqueue (dedup keys make repeats no-ops)
//!
//! JobProcessor.process_due_batch
//!     │
//!     ├─► JobStore.claim_due (FOR UPDATE SKIP LOCKED, flips rows to running)
//!     ├─► HandlerRegistry.get(job_type)
//!     ├─► handler.execute(job, tenant session) inside a savepoint + timeout
//!     └─► completed / retry / dead-letter bookkeeping on the outer transaction
//! ```
//!
//! Business logic stays in the handlers; this module only provides the
//! queue, the claim contract and the execution envelope.

pub mod handlers;
mod job;
mod processor;
mod registry;
mod store;

pub use job::{BackgroundJob, JobStatus, JobType, BACKOFF_BASE_SECONDS};
pub use processor::{sanitize_error, BatchErrorEntry, BatchReport, JobProcessor};
pub use registry::{HandlerRegistry, JobHandler};
pub use store::{
    EnqueueOutcome, EnqueueSpec, JobSort, JobStore, StatusCounts, DEFAULT_CLAIM_BATCH,
    MAX_CLAIM_BATCH,
};

/// Errors owned by the job subsystem.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The wire tag does not name a known job type.
    #[error("invalid job type: {0}")]
    InvalidJobType(String),

    /// No handler registered for a claimed job's type.
    #[error("No handler for job type: {0}")]
    UnknownHandler(JobType),

    /// The job payload is missing or malformed; retrying cannot help.
    #[error("{0}")]
    InvalidPayload(String),
}
