//! Cohort scheduler: periodic triggers that enqueue standard job bundles
//! per tenant tier, plus the billing and remediation sweeps.

mod cohorts;
mod orchestrator;

pub use cohorts::{dedup_key, TenantCohort};
pub use orchestrator::SchedulerOrchestrator;
