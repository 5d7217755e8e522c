//! Background job model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Default retry budget for most job types.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
/// Webhook replays are revenue-critical and get a larger budget.
pub const WEBHOOK_MAX_ATTEMPTS: i32 = 5;
/// Base delay for the exponential retry backoff.
pub const BACKOFF_BASE_SECONDS: i64 = 60;
/// Delay applied when a job is cancelled mid-flight.
pub const CANCEL_RESCHEDULE_SECONDS: i64 = 60;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    /// Transient observable state: a retry has been scheduled.
    Failed,
    /// Terminal: retry budget exhausted.
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLetter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FinopsAnalysis,
    ZombieScan,
    ZombieAnalysis,
    Remediation,
    WebhookRetry,
    Notification,
    CostIngestion,
    RecurringBilling,
    ReportGeneration,
    CostForecast,
    CostExport,
    CostAggregation,
    Dunning,
}

impl JobType {
    pub const ALL: [JobType; 13] = [
        JobType::FinopsAnalysis,
        JobType::ZombieScan,
        JobType::ZombieAnalysis,
        JobType::Remediation,
        JobType::WebhookRetry,
        JobType::Notification,
        JobType::CostIngestion,
        JobType::RecurringBilling,
        JobType::ReportGeneration,
        JobType::CostForecast,
        JobType::CostExport,
        JobType::CostAggregation,
        JobType::Dunning,
    ];

    /// Job types an authenticated user may enqueue directly. Everything else
    /// is system-only and rejected at the HTTP boundary.
    pub const USER_CREATABLE: [JobType; 3] = [
        JobType::FinopsAnalysis,
        JobType::ZombieScan,
        JobType::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FinopsAnalysis => "finops_analysis",
            JobType::ZombieScan => "zombie_scan",
            JobType::ZombieAnalysis => "zombie_analysis",
            JobType::Remediation => "remediation",
            JobType::WebhookRetry => "webhook_retry",
            JobType::Notification => "notification",
            JobType::CostIngestion => "cost_ingestion",
            JobType::RecurringBilling => "recurring_billing",
            JobType::ReportGeneration => "report_generation",
            JobType::CostForecast => "cost_forecast",
            JobType::CostExport => "cost_export",
            JobType::CostAggregation => "cost_aggregation",
            JobType::Dunning => "dunning",
        }
    }

    /// Parse a wire tag. Unknown tags are an error, not a variant.
    pub fn parse(tag: &str) -> Option<JobType> {
        Self::ALL.iter().copied().find(|t| t.as_str() == tag)
    }

    pub fn is_user_creatable(&self) -> bool {
        Self::USER_CREATABLE.contains(self)
    }

    pub fn default_max_attempts(&self) -> i32 {
        match self {
            JobType::WebhookRetry => WEBHOOK_MAX_ATTEMPTS,
            _ => DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// Durable background job stored in PostgreSQL.
///
/// Survives app restarts, retries with exponential backoff, and keeps a full
/// audit trail. Mutated only by the processor (claim/complete/fail) and by
/// checkpoint writes from long-running handlers.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct BackgroundJob {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub job_type: JobType,

    /// Owning tenant; None for system-wide jobs.
    #[builder(default, setter(strip_option))]
    pub tenant_id: Option<Uuid>,

    /// Deduplication key: a second insert with the same key is a no-op.
    #[builder(default, setter(strip_option))]
    pub dedup_key: Option<String>,

    #[builder(default)]
    pub status: JobStatus,

    /// Higher runs earlier; 0 = normal, negative = low priority.
    #[builder(default = 0)]
    pub priority: i32,

    #[builder(default, setter(strip_option))]
    pub payload: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub result: Option<Value>,

    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,

    #[builder(default = Utc::now())]
    pub scheduled_for: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = false)]
    pub is_deleted: bool,
}

impl BackgroundJob {
    /// Delay before the next attempt after a failure at the current attempt
    /// count: `base * 2^(attempts - 1)`.
    pub fn retry_delay(&self, base_seconds: i64) -> Duration {
        let exponent = (self.attempts - 1).max(0).min(16) as u32;
        Duration::seconds(base_seconds * 2i64.pow(exponent))
    }

    /// Whether a failure at the current attempt count exhausts the budget.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Column list shared by the job store queries.
pub(crate) const JOB_COLUMNS: &str = "id, job_type, tenant_id, dedup_key, status, priority, \
     payload, result, attempts, max_attempts, scheduled_for, started_at, completed_at, \
     error_message, created_at, is_deleted";

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> BackgroundJob {
        BackgroundJob::builder().job_type(JobType::ZombieScan).build()
    }

    #[test]
    fn new_job_defaults() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, 0);
        assert!(!job.is_deleted);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn webhook_retry_gets_larger_budget() {
        assert_eq!(JobType::WebhookRetry.default_max_attempts(), 5);
        assert_eq!(JobType::ZombieScan.default_max_attempts(), 3);
    }

    #[test]
    fn user_creatable_set_is_closed() {
        assert!(JobType::FinopsAnalysis.is_user_creatable());
        assert!(JobType::ZombieScan.is_user_creatable());
        assert!(JobType::Notification.is_user_creatable());
        assert!(!JobType::RecurringBilling.is_user_creatable());
        assert!(!JobType::Remediation.is_user_creatable());
        assert!(!JobType::WebhookRetry.is_user_creatable());
    }

    #[test]
    fn parse_round_trips_every_type() {
        for job_type in JobType::ALL {
            assert_eq!(JobType::parse(job_type.as_str()), Some(job_type));
        }
        assert_eq!(JobType::parse("mine_bitcoin"), None);
    }

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let mut job = sample_job();
        job.attempts = 1;
        assert_eq!(job.retry_delay(60), Duration::seconds(60));
        job.attempts = 2;
        assert_eq!(job.retry_delay(60), Duration::seconds(120));
        job.attempts = 3;
        assert_eq!(job.retry_delay(60), Duration::seconds(240));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
    }
}
