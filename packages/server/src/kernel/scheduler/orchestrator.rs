//! Cron triggers that feed the job queue.
//!
//! Every trigger is safe to fire from multiple replicas at once: tenant
//! selection uses `FOR UPDATE SKIP LOCKED` so instances partition the work,
//! and deterministic dedup keys make the overlapping inserts no-ops. All
//! writes of one invocation happen in a single transaction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use sqlx::Acquire;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::cohorts::{dedup_key, TenantCohort};
use crate::common::metrics;
use crate::kernel::jobs::{JobStatus, JobType};
use crate::kernel::AppContext;

/// Deadlock retries per trigger invocation.
const MAX_DEADLOCK_RETRIES: u32 = 3;

pub struct SchedulerOrchestrator {
    ctx: Arc<AppContext>,
}

impl SchedulerOrchestrator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Wire the cron schedule (all UTC) and start the scheduler.
    ///
    /// - HIGH_VALUE cohort: every 6 hours on the hour
    /// - ACTIVE cohort: daily 02:00
    /// - DORMANT cohort: Sunday 03:00
    /// - remediation sweep: Friday 20:00
    /// - billing sweep: daily 04:00
    pub async fn start(&self) -> Result<JobScheduler> {
        let scheduler = JobScheduler::new().await?;

        for (cohort, schedule) in [
            (TenantCohort::HighValue, "0 0 0,6,12,18 * * *"),
            (TenantCohort::Active, "0 0 2 * * *"),
            (TenantCohort::Dormant, "0 0 3 * * Sun"),
        ] {
            let ctx = self.ctx.clone();
            let job = Job::new_async(schedule, move |_uuid, _lock| {
                let ctx = ctx.clone();
                Box::pin(async move {
                    Self::cohort_enqueue(&ctx, cohort).await;
                })
            })?;
            scheduler.add(job).await?;
        }

        let ctx = self.ctx.clone();
        let remediation = Job::new_async("0 0 20 * * Fri", move |_uuid, _lock| {
            let ctx = ctx.clone();
            Box::pin(async move {
                if let Err(e) = Self::remediation_sweep(&ctx).await {
                    error!(error = %e, "remediation_sweep_failed");
                }
            })
        })?;
        scheduler.add(remediation).await?;

        let ctx = self.ctx.clone();
        let billing = Job::new_async("0 0 4 * * *", move |_uuid, _lock| {
            let ctx = ctx.clone();
            Box::pin(async move {
                if let Err(e) = Self::billing_sweep(&ctx).await {
                    error!(error = %e, "billing_sweep_failed");
                }
            })
        })?;
        scheduler.add(billing).await?;

        scheduler.start().await?;
        info!("scheduler_started");
        Ok(scheduler)
    }

    /// Atomically enqueue the standard bundle for every tenant in a cohort.
    ///
    /// Failures never propagate to the cron runner; they end in counters and
    /// logs.
    pub async fn cohort_enqueue(ctx: &AppContext, cohort: TenantCohort) {
        let correlation_id = Uuid::new_v4();
        let span = info_span!(
            "scheduler_cohort_enqueue",
            cohort = %cohort,
            correlation_id = %correlation_id,
        );

        async move {
            let job_name = format!("cohort_{cohort}_enqueue");
            let started = Instant::now();

            let mut attempt = 0u32;
            let status = loop {
                match Self::cohort_enqueue_once(ctx, cohort).await {
                    Ok(enqueued) => {
                        info!(jobs_enqueued = enqueued, "cohort_enqueue_completed");
                        break "success";
                    }
                    Err(e) if is_deadlock(&e) && attempt < MAX_DEADLOCK_RETRIES => {
                        attempt += 1;
                        metrics::record_scheduler_deadlock(cohort.as_str());
                        let backoff = Duration::from_secs(1 << (attempt - 1));
                        warn!(
                            attempt,
                            backoff_seconds = backoff.as_secs(),
                            error = %e,
                            "scheduler_deadlock_detected"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    Err(e) => {
                        error!(error = %e, attempt, "scheduler_cohort_enqueue_failed");
                        break "failure";
                    }
                }
            };

            metrics::record_scheduler_run(&job_name, status);
            metrics::record_scheduler_duration(&job_name, started.elapsed());
        }
        .instrument(span)
        .await
    }

    /// One atomic attempt: lock the cohort's tenants, insert the bundle with
    /// deterministic keys, commit.
    async fn cohort_enqueue_once(ctx: &AppContext, cohort: TenantCohort) -> Result<u64> {
        let mut conn = ctx.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        // SKIP LOCKED: a concurrent replica takes the tenants this one
        // doesn't, instead of deadlocking against it.
        let tenant_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM tenants WHERE plan = ANY($1) FOR UPDATE SKIP LOCKED",
        )
        .bind(cohort.tiers().to_vec())
        .fetch_all(&mut *tx)
        .await?;

        if tenant_ids.is_empty() {
            info!("cohort_empty");
            return Ok(0);
        }

        let now = Utc::now();
        let bucket = cohort.bucket_str(now);

        let mut enqueued = 0u64;
        for tenant_id in &tenant_ids {
            for job_type in cohort.job_bundle() {
                let key = dedup_key(*tenant_id, job_type, &bucket);
                let result = sqlx::query(
                    "INSERT INTO background_jobs \
                         (id, job_type, tenant_id, dedup_key, status, priority, \
                          attempts, max_attempts, scheduled_for, created_at, is_deleted) \
                     VALUES ($1, $2, $3, $4, $5, 0, 0, $6, $7, $7, FALSE) \
                     ON CONFLICT (dedup_key) WHERE dedup_key IS NOT NULL AND NOT is_deleted \
                       DO NOTHING",
                )
                .bind(Uuid::new_v4())
                .bind(job_type)
                .bind(tenant_id)
                .bind(&key)
                .bind(JobStatus::Pending)
                .bind(job_type.default_max_attempts())
                .bind(now)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() > 0 {
                    enqueued += 1;
                    metrics::record_job_enqueued(job_type.as_str(), 0);
                }
            }
        }

        tx.commit().await?;
        info!(
            tenant_count = tenant_ids.len(),
            jobs_enqueued = enqueued,
            bucket = %bucket,
            "cohort_fetch_success"
        );
        Ok(enqueued)
    }

    /// Weekly autonomous remediation sweep: one job per AWS connection.
    pub async fn remediation_sweep(ctx: &AppContext) -> Result<u64> {
        let correlation_id = Uuid::new_v4();
        let span = info_span!("scheduler_remediation_sweep", correlation_id = %correlation_id);

        async move {
            let mut conn = ctx.pool.acquire().await?;
            let mut tx = conn.begin().await?;

            let connections: Vec<(Uuid, Uuid, String)> = sqlx::query_as(
                "SELECT id, tenant_id, region FROM aws_connections FOR UPDATE SKIP LOCKED",
            )
            .fetch_all(&mut *tx)
            .await?;

            let now = Utc::now();
            let mut enqueued = 0u64;
            for (connection_id, tenant_id, region) in &connections {
                let payload = json!({
                    "connection_id": connection_id.to_string(),
                    "region": region,
                });
                let result = sqlx::query(
                    "INSERT INTO background_jobs \
                         (id, job_type, tenant_id, payload, status, priority, \
                          attempts, max_attempts, scheduled_for, created_at, is_deleted) \
                     VALUES ($1, $2, $3, $4, $5, 0, 0, $6, $7, $7, FALSE)",
                )
                .bind(Uuid::new_v4())
                .bind(JobType::Remediation)
                .bind(tenant_id)
                .bind(&payload)
                .bind(JobStatus::Pending)
                .bind(JobType::Remediation.default_max_attempts())
                .bind(now)
                .execute(&mut *tx)
                .await?;
                enqueued += result.rows_affected();
                metrics::record_job_enqueued(JobType::Remediation.as_str(), 0);
            }

            tx.commit().await?;
            info!(enqueued, "remediation_sweep_completed");
            Ok(enqueued)
        }
        .instrument(span)
        .await
    }

    /// Daily billing sweep: one renewal job per due, active subscription
    /// with a stored authorization.
    pub async fn billing_sweep(ctx: &AppContext) -> Result<u64> {
        let correlation_id = Uuid::new_v4();
        let span = info_span!("scheduler_billing_sweep", correlation_id = %correlation_id);

        async move {
            let mut conn = ctx.pool.acquire().await?;
            let mut tx = conn.begin().await?;

            let due: Vec<(Uuid, Uuid)> = sqlx::query_as(
                "SELECT id, tenant_id FROM tenant_subscriptions \
                 WHERE status = 'active' \
                   AND next_payment_date <= NOW() \
                   AND authorization_code IS NOT NULL \
                 FOR UPDATE SKIP LOCKED",
            )
            .fetch_all(&mut *tx)
            .await?;

            let now = Utc::now();
            let mut enqueued = 0u64;
            for (subscription_id, tenant_id) in &due {
                let payload = json!({ "subscription_id": subscription_id.to_string() });
                let result = sqlx::query(
                    "INSERT INTO background_jobs \
                         (id, job_type, tenant_id, payload, status, priority, \
                          attempts, max_attempts, scheduled_for, created_at, is_deleted) \
                     VALUES ($1, $2, $3, $4, $5, 0, 0, $6, $7, $7, FALSE)",
                )
                .bind(Uuid::new_v4())
                .bind(JobType::RecurringBilling)
                .bind(tenant_id)
                .bind(&payload)
                .bind(JobStatus::Pending)
                .bind(JobType::RecurringBilling.default_max_attempts())
                .bind(now)
                .execute(&mut *tx)
                .await?;
                enqueued += result.rows_affected();
                metrics::record_job_enqueued(JobType::RecurringBilling.as_str(), 0);
            }

            tx.commit().await?;
            info!(due_count = due.len(), "billing_sweep_completed");
            Ok(enqueued)
        }
        .instrument(span)
        .await
    }
}

/// Postgres reports deadlocks as SQLSTATE 40P01.
fn is_deadlock(error: &anyhow::Error) -> bool {
    if let Some(db_error) = error
        .downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
    {
        if db_error.code().as_deref() == Some("40P01") {
            return true;
        }
    }
    error.to_string().to_lowercase().contains("deadlock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_detection_matches_sqlstate_and_message() {
        assert!(is_deadlock(&anyhow::anyhow!("deadlock detected")));
        assert!(!is_deadlock(&anyhow::anyhow!("connection refused")));
    }

    #[test]
    fn deadlock_backoff_doubles() {
        let delays: Vec<u64> = (1..=MAX_DEADLOCK_RETRIES)
            .map(|attempt| 1u64 << (attempt - 1))
            .collect();
        assert_eq!(delays, vec![1, 2, 4]);
    }
}
