//! PostgreSQL-backed job store.
//!
//! The store is the only shared mutable resource between workers. Claims go
//! through `FOR UPDATE SKIP LOCKED` so concurrent workers partition the due
//! set instead of fighting over it; dedup keys make repeated enqueues no-ops.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use tracing::info;
use uuid::Uuid;

use super::job::{BackgroundJob, JobStatus, JobType, JOB_COLUMNS};
use crate::common::metrics;
use crate::db;
use crate::db::session::TenantSession;

/// Upper bound on rows claimed per processor invocation.
pub const MAX_CLAIM_BATCH: i64 = 50;
/// Default batch size when the caller does not specify one.
pub const DEFAULT_CLAIM_BATCH: i64 = 10;

/// Result of an enqueue that handles dedup-key idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A new row was written.
    Created(BackgroundJob),
    /// A non-deleted row with the same dedup key already existed.
    Duplicate(BackgroundJob),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &BackgroundJob {
        match self {
            EnqueueOutcome::Created(job) | EnqueueOutcome::Duplicate(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// Parameters for a new job.
#[derive(Debug, Clone)]
pub struct EnqueueSpec {
    pub job_type: JobType,
    pub tenant_id: Option<Uuid>,
    pub payload: Option<Value>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
    pub priority: i32,
    pub dedup_key: Option<String>,
}

impl EnqueueSpec {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            tenant_id: None,
            payload: None,
            scheduled_for: None,
            max_attempts: None,
            priority: 0,
            dedup_key: None,
        }
    }

    pub fn tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Sortable columns for the tenant job listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSort {
    CreatedAt,
    ScheduledFor,
    Status,
}

impl JobSort {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created_at" => Some(Self::CreatedAt),
            "scheduled_for" => Some(Self::ScheduledFor),
            "status" => Some(Self::Status),
            _ => None,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::ScheduledFor => "scheduled_for",
            Self::Status => "status",
        }
    }
}

/// Per-status counts of a tenant's non-deleted jobs.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_letter: i64,
}

/// PostgreSQL job store.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
    backoff_base_seconds: i64,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            backoff_base_seconds: super::job::BACKOFF_BASE_SECONDS,
        }
    }

    pub fn with_backoff_base(pool: PgPool, backoff_base_seconds: i64) -> Self {
        Self {
            pool,
            backoff_base_seconds,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn backoff_base_seconds(&self) -> i64 {
        self.backoff_base_seconds
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    pub async fn enqueue(&self, spec: EnqueueSpec) -> Result<EnqueueOutcome> {
        let mut conn = self.pool.acquire().await?;
        Self::enqueue_on(&mut conn, spec).await
    }

    /// Enqueue on an existing connection so callers can fold the insert into
    /// their own transaction (scheduler, zombie-analysis follow-up).
    pub async fn enqueue_on(conn: &mut PgConnection, spec: EnqueueSpec) -> Result<EnqueueOutcome> {
        let max_attempts = spec
            .max_attempts
            .unwrap_or_else(|| spec.job_type.default_max_attempts());
        let scheduled_for = spec.scheduled_for.unwrap_or_else(Utc::now);

        let insert_sql = format!(
            "INSERT INTO background_jobs \
               (id, job_type, tenant_id, dedup_key, status, priority, payload, \
                attempts, max_attempts, scheduled_for, created_at, is_deleted) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9, NOW(), FALSE) \
             ON CONFLICT (dedup_key) WHERE dedup_key IS NOT NULL AND NOT is_deleted \
               DO NOTHING \
             RETURNING {JOB_COLUMNS}"
        );

        let inserted = db::observed(
            &insert_sql,
            sqlx::query_as::<_, BackgroundJob>(&insert_sql)
                .bind(Uuid::new_v4())
                .bind(spec.job_type)
                .bind(spec.tenant_id)
                .bind(&spec.dedup_key)
                .bind(JobStatus::Pending)
                .bind(spec.priority)
                .bind(&spec.payload)
                .bind(max_attempts)
                .bind(scheduled_for)
                .fetch_optional(&mut *conn),
        )
        .await?;

        if let Some(job) = inserted {
            metrics::record_job_enqueued(job.job_type.as_str(), job.priority);
            return Ok(EnqueueOutcome::Created(job));
        }

        // The insert was a dedup no-op; surface the existing row.
        let key = spec
            .dedup_key
            .as_deref()
            .context("insert affected no row but no dedup key was given")?;
        let existing = Self::find_by_dedup_key(conn, key)
            .await?
            .context("dedup conflict but existing job not found")?;

        Ok(EnqueueOutcome::Duplicate(existing))
    }

    pub async fn find_by_dedup_key(
        conn: &mut PgConnection,
        key: &str,
    ) -> Result<Option<BackgroundJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM background_jobs \
             WHERE dedup_key = $1 AND NOT is_deleted \
             LIMIT 1"
        );
        let job = sqlx::query_as::<_, BackgroundJob>(&sql)
            .bind(key)
            .fetch_optional(conn)
            .await?;
        Ok(job)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<BackgroundJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM background_jobs WHERE id = $1");
        let job = sqlx::query_as::<_, BackgroundJob>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Claim
    // ------------------------------------------------------------------

    /// Claim up to `limit` due jobs atomically.
    ///
    /// Rows already locked by another worker are skipped, and claimed rows
    /// are flipped to `running` (with `started_at` and the attempt counted)
    /// in the same statement, so the row locks are held only for the claim
    /// itself. Execution happens afterwards, outside any lock.
    pub async fn claim_due(&self, limit: i64) -> Result<Vec<BackgroundJob>> {
        let limit = limit.clamp(1, MAX_CLAIM_BATCH);

        let sql = format!(
            "WITH due AS ( \
                 SELECT id FROM background_jobs \
                 WHERE status = 'pending' \
                   AND scheduled_for <= NOW() \
                   AND attempts < max_attempts \
                   AND NOT is_deleted \
                 ORDER BY priority DESC, scheduled_for ASC, id ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE background_jobs \
             SET status = 'running', started_at = NOW(), completed_at = NULL, \
                 attempts = attempts + 1 \
             WHERE id IN (SELECT id FROM due) \
             RETURNING {JOB_COLUMNS}"
        );

        let mut jobs = db::observed(
            &sql,
            sqlx::query_as::<_, BackgroundJob>(&sql)
                .bind(limit)
                .fetch_all(&self.pool),
        )
        .await?;

        // UPDATE ... RETURNING does not preserve the CTE ordering.
        jobs.sort_by(claim_order);
        Ok(jobs)
    }

    // ------------------------------------------------------------------
    // Terminal-state bookkeeping (called by the processor on its own
    // transaction, hence the `_on` connection variants)
    // ------------------------------------------------------------------

    pub async fn mark_completed_on(
        conn: &mut PgConnection,
        job_id: Uuid,
        result: &Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE background_jobs \
             SET status = 'completed', completed_at = NOW(), result = $2, error_message = NULL \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(result)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Schedule the next attempt with exponential backoff. `attempts` has
    /// already been incremented by the claim.
    pub async fn schedule_retry_on(
        conn: &mut PgConnection,
        job: &BackgroundJob,
        error: &str,
        backoff_base_seconds: i64,
    ) -> Result<()> {
        let next_run = Utc::now() + job.retry_delay(backoff_base_seconds);
        sqlx::query(
            "UPDATE background_jobs \
             SET status = 'pending', scheduled_for = $2, error_message = $3, \
                 started_at = NULL \
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(next_run)
        .bind(error)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Cancelled jobs come back after a fixed minute, independent of the
    /// attempt count.
    pub async fn reschedule_cancelled_on(
        conn: &mut PgConnection,
        job_id: Uuid,
        error: &str,
    ) -> Result<()> {
        let next_run = Utc::now() + chrono::Duration::seconds(super::job::CANCEL_RESCHEDULE_SECONDS);
        sqlx::query(
            "UPDATE background_jobs \
             SET status = 'pending', scheduled_for = $2, error_message = $3, \
                 started_at = NULL \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(next_run)
        .bind(error)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn mark_dead_letter_on(
        conn: &mut PgConnection,
        job_id: Uuid,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE background_jobs \
             SET status = 'dead_letter', completed_at = NOW(), error_message = $2 \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(error)
        .execute(conn)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Durable partial-progress write into `payload.partial_scan` so a crash
    /// surfaces already-computed work to the next attempt. Runs on the pool
    /// (autocommit), outside the handler's savepoint on purpose.
    pub async fn checkpoint_partial_scan(
        &self,
        job_id: Uuid,
        category_key: &str,
        items: &Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE background_jobs \
             SET payload = jsonb_set( \
                 jsonb_set(COALESCE(payload, '{}'::jsonb), '{partial_scan}', \
                           COALESCE(payload #> '{partial_scan}', '{}'::jsonb), true), \
                 ARRAY['partial_scan', $2], $3, true) \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(category_key)
        .bind(items)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administrative surface
    // ------------------------------------------------------------------

    pub async fn soft_delete(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE background_jobs SET is_deleted = TRUE WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Permanently remove a job row. This is the sole hard-delete path, and
    /// it writes the audit record for the deletion.
    pub async fn hard_delete(&self, job_id: Uuid) -> Result<bool> {
        let Some(job) = self.find_by_id(job_id).await? else {
            return Ok(false);
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO audit_log (id, event, resource_type, resource_id, tenant_id, detail, created_at) \
             VALUES ($1, 'resource_permanently_deleted', 'background_job', $2, $3, $4, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(job.id.to_string())
        .bind(job.tenant_id)
        .bind(serde_json::json!({ "job_type": job.job_type.as_str() }))
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM background_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(
            resource_type = "background_job",
            resource_id = %job.id,
            job_type = %job.job_type,
            "resource_permanently_deleted"
        );
        Ok(true)
    }

    /// Tenant-scoped listing. Runs through the tenant session so RLS context
    /// is enforced like any other user-table read.
    pub async fn list_by_tenant(
        session: &mut TenantSession<'_>,
        tenant_id: Uuid,
        status: Option<JobStatus>,
        sort: JobSort,
        descending: bool,
        limit: i64,
    ) -> Result<Vec<BackgroundJob>> {
        let limit = limit.clamp(1, 100);
        let direction = if descending { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM background_jobs \
             WHERE tenant_id = $1 AND NOT is_deleted \
               AND ($2::job_status IS NULL OR status = $2) \
             ORDER BY {} {} \
             LIMIT $3",
            sort.column(),
            direction,
        );

        let jobs = sqlx::query_as::<_, BackgroundJob>(&sql)
            .bind(tenant_id)
            .bind(status)
            .bind(limit)
            .fetch_all(session.executor(&sql)?)
            .await?;
        Ok(jobs)
    }

    pub async fn count_by_status(
        session: &mut TenantSession<'_>,
        tenant_id: Uuid,
    ) -> Result<StatusCounts> {
        let sql = "SELECT status, COUNT(*) AS count FROM background_jobs \
                   WHERE tenant_id = $1 AND NOT is_deleted \
                   GROUP BY status";
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(sql)
            .bind(tenant_id)
            .fetch_all(session.executor(sql)?)
            .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status {
                JobStatus::Pending => counts.pending = count,
                JobStatus::Running => counts.running = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
                JobStatus::DeadLetter => counts.dead_letter = count,
            }
        }
        Ok(counts)
    }
}

/// Claim ordering: `priority DESC, scheduled_for ASC`, ties broken by id.
fn claim_order(a: &BackgroundJob, b: &BackgroundJob) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.scheduled_for.cmp(&b.scheduled_for))
        .then(a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with(priority: i32, offset_secs: i64) -> BackgroundJob {
        BackgroundJob::builder()
            .job_type(JobType::Notification)
            .priority(priority)
            .scheduled_for(Utc::now() + chrono::Duration::seconds(offset_secs))
            .build()
    }

    #[test]
    fn claim_order_prefers_higher_priority() {
        let high = job_with(5, 100);
        let normal = job_with(0, -100);
        assert_eq!(claim_order(&high, &normal), std::cmp::Ordering::Less);
    }

    #[test]
    fn claim_order_breaks_ties_on_schedule_time() {
        let earlier = job_with(0, -100);
        let later = job_with(0, 100);
        assert_eq!(claim_order(&earlier, &later), std::cmp::Ordering::Less);
    }

    #[test]
    fn job_sort_parses_known_columns_only() {
        assert_eq!(JobSort::parse("created_at"), Some(JobSort::CreatedAt));
        assert_eq!(JobSort::parse("scheduled_for"), Some(JobSort::ScheduledFor));
        assert_eq!(JobSort::parse("status"), Some(JobSort::Status));
        assert_eq!(JobSort::parse("payload"), None);
    }

    #[test]
    fn enqueue_spec_defaults_max_attempts_per_type() {
        let spec = EnqueueSpec::new(JobType::WebhookRetry);
        assert_eq!(
            spec.max_attempts
                .unwrap_or_else(|| spec.job_type.default_max_attempts()),
            5
        );
    }

    #[test]
    fn enqueue_outcome_exposes_job_either_way() {
        let job = job_with(0, 0);
        let created = EnqueueOutcome::Created(job.clone());
        assert!(created.is_created());
        assert_eq!(created.job().id, job.id);
        let dup = EnqueueOutcome::Duplicate(job.clone());
        assert!(!dup.is_created());
    }
}
