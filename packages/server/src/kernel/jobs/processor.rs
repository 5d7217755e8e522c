//! Job processor: claims due jobs and runs their handlers.
//!
//! One invocation processes at most `limit` jobs and does not loop; a
//! periodic trigger (HTTP process endpoints or the in-process poller in
//! `main`) re-invokes it. Handler work runs inside a savepoint so partial
//! database writes never survive a failure, while status bookkeeping happens
//! on the outer transaction.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Acquire, PgConnection};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::job::{BackgroundJob, JobType};
use super::registry::HandlerRegistry;
use super::store::JobStore;
use super::JobError;
use crate::db::session::TenantSession;

/// Default per-job handler timeout.
pub const JOB_TIMEOUT_SECONDS: u64 = 300;

/// One failed job inside a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchErrorEntry {
    pub job_id: Uuid,
    pub error: String,
    /// `config` for invalid-input failures, `handler` otherwise.
    pub kind: &'static str,
}

/// Outcome summary of one `process_due_batch` invocation.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<BatchErrorEntry>,
    /// Set when the claim itself failed; remaining jobs were not processed.
    pub batch_error: Option<String>,
}

/// How a handler invocation ended.
enum HandlerOutcome {
    Completed(Value),
    Failed(anyhow::Error),
    TimedOut,
    Cancelled,
}

pub struct JobProcessor {
    store: JobStore,
    registry: Arc<HandlerRegistry>,
    job_timeout: Duration,
    cancel: CancellationToken,
}

impl JobProcessor {
    pub fn new(store: JobStore, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            registry,
            job_timeout: Duration::from_secs(JOB_TIMEOUT_SECONDS),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    /// Token observed while handlers run; cancelling it reschedules in-flight
    /// jobs for a minute out, independent of their attempt counts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Claim and process up to `limit` due jobs.
    ///
    /// Jobs are attempted in claim order (priority first); a failing job
    /// never aborts the rest of the batch.
    pub async fn process_due_batch(&self, limit: i64) -> BatchReport {
        let span = info_span!("process_pending_jobs", batch_limit = limit);
        self.process_due_batch_inner(limit).instrument(span).await
    }

    async fn process_due_batch_inner(&self, limit: i64) -> BatchReport {
        let mut report = BatchReport::default();

        let jobs = match self.store.claim_due(limit).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "job_processor_batch_db_error");
                report.batch_error = Some(e.to_string());
                return report;
            }
        };

        info!(pending_count = jobs.len(), "job_processor_batch_start");

        for job in jobs {
            let job_id = job.id;
            report.processed += 1;

            match self.process_single(job).await {
                Ok(None) => report.succeeded += 1,
                Ok(Some(entry)) => {
                    report.failed += 1;
                    report.errors.push(entry);
                }
                Err(e) => {
                    // Bookkeeping itself failed; record and move on so one
                    // broken job cannot starve the rest of the batch.
                    error!(job_id = %job_id, error = %e, "job_bookkeeping_failed");
                    report.failed += 1;
                    report.errors.push(BatchErrorEntry {
                        job_id,
                        error: e.to_string(),
                        kind: "handler",
                    });
                }
            }
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            "job_processor_batch_complete"
        );
        report
    }

    /// Run one claimed job. Returns `Ok(None)` on success, `Ok(Some(entry))`
    /// when the handler failed and the failure was recorded on the job row.
    async fn process_single(&self, job: BackgroundJob) -> Result<Option<BatchErrorEntry>> {
        let span = info_span!(
            "job_process",
            job_type = %job.job_type,
            job_id = %job.id,
            tenant_id = %job.tenant_id.map(|t| t.to_string()).unwrap_or_else(|| "system".into()),
            attempt = job.attempts,
        );
        self.process_single_inner(job).instrument(span).await
    }

    async fn process_single_inner(&self, job: BackgroundJob) -> Result<Option<BatchErrorEntry>> {
        info!("job_processing_start");

        // The claim already flipped the row to running and counted the
        // attempt; from here on we only decide how the attempt ends.
        let handler = match self.registry.get(job.job_type) {
            Ok(handler) => handler,
            Err(e @ JobError::UnknownHandler(_)) => {
                // Recorded on the job and sent down the normal failure path.
                let mut conn = self.store.pool().acquire().await?;
                let entry = self.record_failure(&mut conn, &job, e.to_string(), "handler").await?;
                return Ok(Some(entry));
            }
            Err(e) => return Err(e.into()),
        };

        let mut conn = self.store.pool().acquire().await?;
        let mut tx = conn.begin().await?;

        let outcome = {
            let mut savepoint = tx.begin().await?;

            let run = run_handler(handler.as_ref(), &job, &mut savepoint);
            let outcome = tokio::select! {
                // Cancellation takes precedence over a simultaneous completion.
                biased;
                _ = self.cancel.cancelled() => HandlerOutcome::Cancelled,
                result = tokio::time::timeout(self.job_timeout, run) => match result {
                    Ok(Ok(value)) => HandlerOutcome::Completed(value),
                    Ok(Err(e)) => HandlerOutcome::Failed(e),
                    Err(_) => HandlerOutcome::TimedOut,
                },
            };

            // Handler-scoped rollback is the isolation guarantee: partial
            // writes never coexist with a non-completed status.
            match &outcome {
                HandlerOutcome::Completed(_) => savepoint.commit().await?,
                _ => savepoint.rollback().await?,
            }
            outcome
        };

        let entry = match outcome {
            HandlerOutcome::Completed(result) => {
                JobStore::mark_completed_on(&mut tx, job.id, &result).await?;
                info!("job_processing_success");
                None
            }
            HandlerOutcome::TimedOut => {
                let message = format!("Job timed out after {}s", self.job_timeout.as_secs());
                error!(timeout_seconds = self.job_timeout.as_secs(), "job_processing_timeout");
                Some(self.fail_on(&mut tx, &job, message, "handler").await?)
            }
            HandlerOutcome::Cancelled => {
                let message = "Job was cancelled".to_string();
                warn!("job_processing_cancelled");
                JobStore::reschedule_cancelled_on(&mut tx, job.id, &message).await?;
                Some(BatchErrorEntry {
                    job_id: job.id,
                    error: message,
                    kind: "handler",
                })
            }
            HandlerOutcome::Failed(e) => {
                error!(error = %e, "job_processing_failed");
                let kind = classify_failure(&e);
                match kind {
                    FailureKind::Invalid => {
                        // Retrying cannot fix a bad payload.
                        JobStore::mark_dead_letter_on(&mut tx, job.id, &e.to_string()).await?;
                        Some(BatchErrorEntry {
                            job_id: job.id,
                            error: e.to_string(),
                            kind: "config",
                        })
                    }
                    FailureKind::Retryable => {
                        Some(self.fail_on(&mut tx, &job, e.to_string(), "handler").await?)
                    }
                }
            }
        };

        tx.commit().await?;
        Ok(entry)
    }

    /// Retry-or-dead-letter decision for a failed attempt.
    async fn fail_on(
        &self,
        conn: &mut PgConnection,
        job: &BackgroundJob,
        error: String,
        kind: &'static str,
    ) -> Result<BatchErrorEntry> {
        if job.attempts_exhausted() {
            JobStore::mark_dead_letter_on(conn, job.id, &error).await?;
        } else {
            JobStore::schedule_retry_on(conn, job, &error, self.store.backoff_base_seconds())
                .await?;
        }
        Ok(BatchErrorEntry {
            job_id: job.id,
            error,
            kind,
        })
    }

    /// Failure path used before any transaction exists (missing handler).
    async fn record_failure(
        &self,
        conn: &mut PgConnection,
        job: &BackgroundJob,
        error: String,
        kind: &'static str,
    ) -> Result<BatchErrorEntry> {
        self.fail_on(conn, job, error, kind).await
    }
}

/// Execute the handler inside the savepoint with tenant context applied.
async fn run_handler(
    handler: &dyn super::registry::JobHandler,
    job: &BackgroundJob,
    savepoint: &mut PgConnection,
) -> Result<Value> {
    let mut session = match job.tenant_id {
        Some(tenant_id) => TenantSession::for_tenant(savepoint, tenant_id).await?,
        None => TenantSession::system(savepoint),
    };
    handler.execute(job, &mut session).await
}

enum FailureKind {
    Invalid,
    Retryable,
}

/// Classify a handler error for the retry decision.
///
/// Invalid-input failures (missing payload fields, unparseable payloads) are
/// permanent; everything else is assumed transient and retried up to the
/// attempt budget.
fn classify_failure(error: &anyhow::Error) -> FailureKind {
    if let Some(job_error) = error.downcast_ref::<JobError>() {
        if matches!(job_error, JobError::InvalidPayload(_)) {
            return FailureKind::Invalid;
        }
    }

    let message = error.to_string().to_lowercase();
    if message.contains("required for") || message.contains("invalid payload") {
        return FailureKind::Invalid;
    }

    FailureKind::Retryable
}

/// Strip internal detail from a stored error message before it leaves the
/// system: everything after the first colon stays private.
pub fn sanitize_error(message: &str) -> &str {
    match message.split_once(':') {
        Some((head, _)) => head,
        None => message,
    }
}

/// Convenience constructor for handlers validating their payloads.
pub(crate) fn required_field<'a>(
    payload: Option<&'a Value>,
    field: &str,
    job_type: JobType,
) -> Result<&'a Value> {
    payload
        .and_then(|p| p.get(field))
        .filter(|v| !v.is_null())
        .ok_or_else(|| JobError::InvalidPayload(format!("{field} required for {job_type}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_invalid_payload_error() {
        let err: anyhow::Error = JobError::InvalidPayload("message required for notification".into()).into();
        assert!(matches!(classify_failure(&err), FailureKind::Invalid));
    }

    #[test]
    fn classify_heuristic_invalid_message() {
        let err = anyhow::anyhow!("tenant_id required for zombie_scan");
        assert!(matches!(classify_failure(&err), FailureKind::Invalid));
    }

    #[test]
    fn classify_transient_error() {
        let err = anyhow::anyhow!("connection reset by peer");
        assert!(matches!(classify_failure(&err), FailureKind::Retryable));
    }

    #[test]
    fn sanitize_strips_after_first_colon() {
        assert_eq!(
            sanitize_error("error sending request: connection refused (10.0.0.3:5432)"),
            "error sending request"
        );
        assert_eq!(sanitize_error("boom"), "boom");
    }

    #[test]
    fn required_field_accepts_present_values() {
        let payload = serde_json::json!({ "message": "hi" });
        let value = required_field(Some(&payload), "message", JobType::Notification).unwrap();
        assert_eq!(value.as_str(), Some("hi"));
    }

    #[test]
    fn required_field_rejects_missing_and_null() {
        let payload = serde_json::json!({ "message": null });
        assert!(required_field(Some(&payload), "message", JobType::Notification).is_err());
        assert!(required_field(None, "message", JobType::Notification).is_err());
    }
}
