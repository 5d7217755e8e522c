//! Job store and processor lifecycle tests against a real Postgres.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use skysweep_core::db::session::TenantSession;
use skysweep_core::kernel::jobs::{
    BackgroundJob, EnqueueSpec, HandlerRegistry, JobError, JobHandler, JobProcessor, JobStatus,
    JobStore, JobType,
};
use uuid::Uuid;

use common::{create_tenant, fresh_pool};

struct SucceedingHandler;

#[async_trait]
impl JobHandler for SucceedingHandler {
    async fn execute(
        &self,
        _job: &BackgroundJob,
        _session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        Ok(json!({ "status": "completed" }))
    }
}

struct FailingHandler;

#[async_trait]
impl JobHandler for FailingHandler {
    async fn execute(
        &self,
        _job: &BackgroundJob,
        _session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        anyhow::bail!("boom")
    }
}

struct InvalidPayloadHandler;

#[async_trait]
impl JobHandler for InvalidPayloadHandler {
    async fn execute(
        &self,
        _job: &BackgroundJob,
        _session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        Err(JobError::InvalidPayload("message required for notification".into()).into())
    }
}

/// Writes a row, then fails: the write must not survive.
struct WriteThenFailHandler;

#[async_trait]
impl JobHandler for WriteThenFailHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let sql = "INSERT INTO audit_log (id, event, resource_type, resource_id, created_at) \
                   VALUES ($1, 'handler_side_effect', 'test', $2, NOW())";
        sqlx::query(sql)
            .bind(Uuid::new_v4())
            .bind(job.id.to_string())
            .execute(session.executor(sql)?)
            .await?;
        anyhow::bail!("failed after writing")
    }
}

fn registry_with(job_type: JobType, handler: Arc<dyn JobHandler>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(job_type, handler);
    Arc::new(registry)
}

async fn fetch_job(store: &JobStore, id: Uuid) -> BackgroundJob {
    store.find_by_id(id).await.expect("fetch").expect("job exists")
}

async fn make_due(pool: &sqlx::PgPool, id: Uuid) {
    sqlx::query("UPDATE background_jobs SET scheduled_for = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .expect("reset schedule");
}

#[tokio::test]
async fn enqueue_with_same_dedup_key_returns_existing_row() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;

    let spec = || {
        EnqueueSpec::new(JobType::ZombieScan)
            .tenant(tenant)
            .dedup_key(format!("{tenant}:zombie_scan:2026-01-01-00"))
    };

    let first = store.enqueue(spec()).await.expect("first enqueue");
    let second = store.enqueue(spec()).await.expect("second enqueue");

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(first.job().id, second.job().id);

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM background_jobs WHERE dedup_key LIKE $1",
    )
    .bind(format!("{tenant}:%"))
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn concurrent_claims_never_hand_out_the_same_job() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;

    let job = store
        .enqueue(EnqueueSpec::new(JobType::Notification).tenant(tenant))
        .await
        .expect("enqueue");
    let job_id = job.job().id;

    let store_a = store.clone();
    let store_b = store.clone();
    let (a, b) = tokio::join!(store_a.claim_due(10), store_b.claim_due(10));
    let a = a.expect("claim a");
    let b = b.expect("claim b");

    let total = a.len() + b.len();
    assert_eq!(total, 1, "exactly one worker received the job");
    let claimed = a.first().or(b.first()).expect("claimed job");
    assert_eq!(claimed.id, job_id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert!(claimed.started_at.is_some());
    assert_eq!(claimed.attempts, 1);
}

#[tokio::test]
async fn claims_respect_priority_before_schedule_time() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;

    let past = Utc::now() - chrono::Duration::minutes(10);
    let low = store
        .enqueue(
            EnqueueSpec::new(JobType::Notification)
                .tenant(tenant)
                .priority(-1)
                .scheduled_for(past),
        )
        .await
        .unwrap();
    let high = store
        .enqueue(
            EnqueueSpec::new(JobType::Notification)
                .tenant(tenant)
                .priority(5)
                .scheduled_for(Utc::now() - chrono::Duration::minutes(1)),
        )
        .await
        .unwrap();

    let claimed = store.claim_due(10).await.expect("claim");
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].id, high.job().id, "higher priority first");
    assert_eq!(claimed[1].id, low.job().id);
}

#[tokio::test]
async fn retries_back_off_then_dead_letter() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;
    let processor = JobProcessor::new(
        store.clone(),
        registry_with(JobType::Notification, Arc::new(FailingHandler)),
    );

    let job_id = store
        .enqueue(EnqueueSpec::new(JobType::Notification).tenant(tenant))
        .await
        .unwrap()
        .job()
        .id;

    // Attempt 1: fails, retry in 60 s.
    let report = processor.process_due_batch(10).await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);

    let job = fetch_job(&store, job_id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error_message.as_deref(), Some("boom"));
    let delta = (job.scheduled_for - Utc::now()).num_seconds();
    assert!((50..=70).contains(&delta), "first backoff ~60s, got {delta}");

    // Attempt 2: fails, retry in 120 s.
    make_due(&pool, job_id).await;
    processor.process_due_batch(10).await;
    let job = fetch_job(&store, job_id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 2);
    let delta = (job.scheduled_for - Utc::now()).num_seconds();
    assert!((110..=130).contains(&delta), "second backoff ~120s, got {delta}");

    // Attempt 3: budget exhausted, dead letter.
    make_due(&pool, job_id).await;
    processor.process_due_batch(10).await;
    let job = fetch_job(&store, job_id).await;
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_message.as_deref(), Some("boom"));
    assert!(job.completed_at.is_some());

    // Dead-lettered jobs are never claimed again.
    make_due(&pool, job_id).await;
    let report = processor.process_due_batch(10).await;
    assert_eq!(report.processed, 0);
}

#[tokio::test]
async fn successful_jobs_store_their_result() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;
    let processor = JobProcessor::new(
        store.clone(),
        registry_with(JobType::Notification, Arc::new(SucceedingHandler)),
    );

    let job_id = store
        .enqueue(EnqueueSpec::new(JobType::Notification).tenant(tenant))
        .await
        .unwrap()
        .job()
        .id;

    let report = processor.process_due_batch(10).await;
    assert_eq!(report.succeeded, 1);

    let job = fetch_job(&store, job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
    assert!(job.error_message.is_none());
    assert_eq!(job.result, Some(json!({ "status": "completed" })));
}

#[tokio::test]
async fn invalid_payload_dead_letters_without_retry() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;
    let processor = JobProcessor::new(
        store.clone(),
        registry_with(JobType::Notification, Arc::new(InvalidPayloadHandler)),
    );

    let job_id = store
        .enqueue(EnqueueSpec::new(JobType::Notification).tenant(tenant))
        .await
        .unwrap()
        .job()
        .id;

    let report = processor.process_due_batch(10).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].kind, "config");

    let job = fetch_job(&store, job_id).await;
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempts, 1, "no retries were scheduled");
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn missing_handler_follows_the_failure_path() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;
    // Registry without a notification handler.
    let processor = JobProcessor::new(
        store.clone(),
        registry_with(JobType::ZombieScan, Arc::new(SucceedingHandler)),
    );

    let job_id = store
        .enqueue(EnqueueSpec::new(JobType::Notification).tenant(tenant))
        .await
        .unwrap()
        .job()
        .id;

    processor.process_due_batch(10).await;
    let job = fetch_job(&store, job_id).await;
    assert_eq!(job.status, JobStatus::Pending, "scheduled for retry");
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("No handler for job type"));
}

#[tokio::test]
async fn handler_writes_roll_back_on_failure() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;
    let processor = JobProcessor::new(
        store.clone(),
        registry_with(JobType::Notification, Arc::new(WriteThenFailHandler)),
    );

    let job_id = store
        .enqueue(EnqueueSpec::new(JobType::Notification).tenant(tenant))
        .await
        .unwrap()
        .job()
        .id;

    processor.process_due_batch(10).await;

    // The failure bookkeeping committed...
    let job = fetch_job(&store, job_id).await;
    assert_eq!(job.status, JobStatus::Pending);
    // ...but the handler's own write did not.
    let side_effects: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM audit_log WHERE event = 'handler_side_effect' AND resource_id = $1",
    )
    .bind(job_id.to_string())
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(side_effects, 0);
}

#[tokio::test]
async fn timeout_is_recorded_and_retried() {
    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn execute(
            &self,
            _job: &BackgroundJob,
            _session: &mut TenantSession<'_>,
        ) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;
    let processor = JobProcessor::new(
        store.clone(),
        registry_with(JobType::Notification, Arc::new(SlowHandler)),
    )
    .with_timeout(Duration::from_secs(1));

    let job_id = store
        .enqueue(EnqueueSpec::new(JobType::Notification).tenant(tenant))
        .await
        .unwrap()
        .job()
        .id;

    processor.process_due_batch(10).await;
    let job = fetch_job(&store, job_id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.error_message.as_deref(), Some("Job timed out after 1s"));
}

#[tokio::test]
async fn cancellation_reschedules_one_minute_out() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;
    let processor = JobProcessor::new(
        store.clone(),
        registry_with(JobType::Notification, Arc::new(SucceedingHandler)),
    );

    // Exhaust all but the last attempt so we can see cancellation ignore
    // the attempt count.
    let job_id = store
        .enqueue(
            EnqueueSpec::new(JobType::Notification)
                .tenant(tenant)
                .max_attempts(3),
        )
        .await
        .unwrap()
        .job()
        .id;
    sqlx::query("UPDATE background_jobs SET attempts = 2 WHERE id = $1")
        .bind(job_id)
        .execute(&pool)
        .await
        .unwrap();

    processor.cancellation_token().cancel();
    processor.process_due_batch(10).await;

    let job = fetch_job(&store, job_id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.error_message.as_deref(), Some("Job was cancelled"));
    let delta = (job.scheduled_for - Utc::now()).num_seconds();
    assert!((50..=70).contains(&delta), "cancel reschedule ~60s, got {delta}");
}

#[tokio::test]
async fn soft_deleted_jobs_are_invisible_to_claims() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;

    let job_id = store
        .enqueue(EnqueueSpec::new(JobType::Notification).tenant(tenant))
        .await
        .unwrap()
        .job()
        .id;
    assert!(store.soft_delete(job_id).await.unwrap());

    let claimed = store.claim_due(10).await.unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn hard_delete_writes_the_audit_record() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;

    let job_id = store
        .enqueue(EnqueueSpec::new(JobType::Notification).tenant(tenant))
        .await
        .unwrap()
        .job()
        .id;
    assert!(store.hard_delete(job_id).await.unwrap());

    assert!(store.find_by_id(job_id).await.unwrap().is_none());
    let audited: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM audit_log \
         WHERE event = 'resource_permanently_deleted' AND resource_id = $1",
    )
    .bind(job_id.to_string())
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(audited, 1);
}
