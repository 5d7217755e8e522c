//! Background-jobs API: enqueue, list, status, processing triggers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::common::AppError;
use crate::db::session::TenantSession;
use crate::kernel::jobs::{
    sanitize_error, BackgroundJob, EnqueueSpec, JobError, JobSort, JobStatus, JobStore, JobType,
    StatusCounts, MAX_CLAIM_BATCH,
};
use crate::server::app::AppState;
use crate::server::middleware::{AuthUser, Role};

#[derive(Debug, Deserialize)]
pub struct EnqueueJobRequest {
    pub job_type: String,
    pub payload: Option<Value>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub job_type: String,
    pub status: String,
    pub attempts: i32,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobResponse {
    fn from_job(job: &BackgroundJob) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type.as_str().to_string(),
            status: job.status.as_str().to_string(),
            attempts: job.attempts,
            scheduled_for: job.scheduled_for,
            created_at: job.created_at,
            // Internal detail after the first colon never leaves the API.
            error_message: job
                .error_message
                .as_deref()
                .map(|m| sanitize_error(m).to_string()),
        }
    }
}

/// Enqueue a new background job.
///
/// Only a closed subset of job types may be created by users; everything
/// else is system-only and yields 403.
pub async fn enqueue_job(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<EnqueueJobRequest>,
) -> Result<Json<JobResponse>, AppError> {
    let job_type = JobType::parse(&request.job_type).ok_or_else(|| {
        AppError::BadRequest(JobError::InvalidJobType(request.job_type.clone()).to_string())
    })?;

    if !job_type.is_user_creatable() {
        let allowed: Vec<&str> = JobType::USER_CREATABLE.iter().map(|t| t.as_str()).collect();
        return Err(AppError::Forbidden(format!(
            "Unauthorized job type. Users can only enqueue: {}",
            allowed.join(", ")
        )));
    }

    let mut spec = EnqueueSpec::new(job_type).tenant(user.tenant_id);
    if let Some(payload) = request.payload {
        spec = spec.payload(payload);
    }
    if let Some(at) = request.scheduled_for {
        spec = spec.scheduled_for(at);
    }

    let outcome = state.ctx.store.enqueue(spec).await?;
    Ok(Json(JobResponse::from_job(outcome.job())))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_sort")]
    pub sort_by: String,
    #[serde(default = "default_order")]
    pub order: String,
}

fn default_limit() -> i64 {
    20
}
fn default_sort() -> String {
    "created_at".to_string()
}
fn default_order() -> String {
    "desc".to_string()
}

/// List recent jobs for the caller's tenant.
pub async fn list_jobs(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobResponse>>, AppError> {
    if !(1..=100).contains(&query.limit) {
        return Err(AppError::BadRequest("limit must be between 1 and 100".into()));
    }
    let sort = JobSort::parse(&query.sort_by)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid sort_by: {}", query.sort_by)))?;
    let descending = match query.order.as_str() {
        "desc" => true,
        "asc" => false,
        other => return Err(AppError::BadRequest(format!("Invalid order: {other}"))),
    };
    let status = match &query.status {
        None => None,
        Some(raw) => Some(parse_status(raw)?),
    };

    let mut conn = state.ctx.pool.acquire().await.map_err(anyhow::Error::from)?;
    let mut session = TenantSession::for_request(&mut conn, Some(user.tenant_id))
        .await
        .map_err(anyhow::Error::from)?;

    let jobs = JobStore::list_by_tenant(
        &mut session,
        user.tenant_id,
        status,
        sort,
        descending,
        query.limit,
    )
    .await?;

    Ok(Json(jobs.iter().map(JobResponse::from_job).collect()))
}

fn parse_status(raw: &str) -> Result<JobStatus, AppError> {
    match raw {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "dead_letter" => Ok(JobStatus::DeadLetter),
        other => Err(AppError::BadRequest(format!("Invalid status: {other}"))),
    }
}

/// Job queue statistics for the caller's tenant. Admin only.
pub async fn job_status(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<StatusCounts>, AppError> {
    user.require_role(Role::Admin)?;

    let mut conn = state.ctx.pool.acquire().await.map_err(anyhow::Error::from)?;
    let mut session = TenantSession::for_request(&mut conn, Some(user.tenant_id))
        .await
        .map_err(anyhow::Error::from)?;

    let counts = JobStore::count_by_status(&mut session, user.tenant_id).await?;
    Ok(Json(counts))
}

#[derive(Debug, Deserialize)]
pub struct ProcessQuery {
    #[serde(default = "default_process_limit")]
    pub limit: i64,
}

fn default_process_limit() -> i64 {
    10
}

#[derive(Debug, Serialize)]
pub struct ProcessJobsResponse {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Run a processing batch inline. Admin only.
pub async fn process_jobs(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ProcessQuery>,
) -> Result<Json<ProcessJobsResponse>, AppError> {
    user.require_role(Role::Admin)?;
    if !(1..=MAX_CLAIM_BATCH).contains(&query.limit) {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {MAX_CLAIM_BATCH}"
        )));
    }

    let report = state.processor.process_due_batch(query.limit).await;
    Ok(Json(ProcessJobsResponse {
        processed: report.processed,
        succeeded: report.succeeded,
        failed: report.failed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InternalProcessQuery {
    pub secret: String,
}

/// Internal endpoint for the external cron trigger. Authenticated by a
/// shared secret, compared in constant time; the batch runs asynchronously.
pub async fn internal_process_jobs(
    State(state): State<AppState>,
    Query(query): Query<InternalProcessQuery>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if !constant_time_eq(&query.secret, &state.ctx.config.internal_job_secret) {
        return Err(AppError::Forbidden("Invalid secret".into()));
    }

    let processor = state.processor.clone();
    let limit = state.ctx.config.max_jobs_per_batch;
    tokio::spawn(async move {
        let report = processor.process_due_batch(limit).await;
        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            "internal_batch_complete"
        );
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "accepted",
            "message": "Job processing started in background"
        })),
    ))
}

/// Digest comparison gives constant-time equality without branching on the
/// secret bytes.
fn constant_time_eq(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_compares_values() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "Secret"));
        assert!(!constant_time_eq("secret", "secret "));
    }

    #[test]
    fn status_parser_rejects_unknown_values() {
        assert!(parse_status("pending").is_ok());
        assert!(parse_status("dead_letter").is_ok());
        assert!(parse_status("zombie").is_err());
    }

    #[test]
    fn job_response_sanitizes_error_messages() {
        let mut job = BackgroundJob::builder().job_type(JobType::Notification).build();
        job.error_message = Some("upstream failed: secret detail".to_string());
        let response = JobResponse::from_job(&job);
        assert_eq!(response.error_message.as_deref(), Some("upstream failed"));
    }
}
