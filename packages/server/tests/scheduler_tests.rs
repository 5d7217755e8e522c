//! Cohort scheduler atomicity and sweep tests against a real Postgres.

mod common;

use std::sync::Arc;

use chrono::Utc;
use skysweep_core::config::{Config, DbSslMode};
use skysweep_core::kernel::scheduler::{SchedulerOrchestrator, TenantCohort};
use skysweep_core::kernel::AppContext;
use sqlx::PgPool;
use uuid::Uuid;

use common::{create_tenant, fresh_pool};

fn test_config() -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        port: 0,
        environment: "test".to_string(),
        db_ssl_mode: DbSslMode::Disable,
        db_ssl_ca_cert_path: None,
        max_jobs_per_batch: 10,
        job_timeout_seconds: 300,
        backoff_base_seconds: 60,
        webhook_max_attempts: 5,
        zombie_plugin_timeout_seconds: 30,
        zombie_scan_deadline_seconds: 300,
        redis_url: None,
        ratelimit_enabled: false,
        internal_job_secret: "test-secret".to_string(),
        jwt_secret: "test-jwt".to_string(),
        slack_bot_token: None,
        slack_channel_id: None,
        paystack_secret_key: None,
        llm_api_url: None,
        llm_api_key: None,
    }
}

async fn test_ctx(pool: PgPool) -> Arc<AppContext> {
    Arc::new(AppContext::new(test_config(), pool).await)
}

async fn count_jobs_for(pool: &PgPool, tenant_ids: &[Uuid]) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM background_jobs WHERE tenant_id = ANY($1)")
        .bind(tenant_ids.to_vec())
        .fetch_one(pool)
        .await
        .expect("count jobs")
}

#[tokio::test]
async fn cohort_trigger_enqueues_one_bundle_per_tenant_exactly_once() {
    let pool = fresh_pool().await;
    let ctx = test_ctx(pool.clone()).await;

    let mut tenants = Vec::new();
    for _ in 0..50 {
        tenants.push(create_tenant(&pool, "growth").await);
    }

    // First firing: 3 jobs per tenant.
    SchedulerOrchestrator::cohort_enqueue(&ctx, TenantCohort::Active).await;
    assert_eq!(count_jobs_for(&pool, &tenants).await, 150);

    // Second firing in the same bucket: all inserts are no-ops.
    SchedulerOrchestrator::cohort_enqueue(&ctx, TenantCohort::Active).await;
    assert_eq!(count_jobs_for(&pool, &tenants).await, 150);

    // Every job carries the deterministic key for the shared bucket.
    let bucket = TenantCohort::Active.bucket_str(Utc::now());
    let keyed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM background_jobs \
         WHERE tenant_id = ANY($1) AND dedup_key = ($2 || ':finops_analysis:' || $3)",
    )
    .bind(vec![tenants[0]])
    .bind(tenants[0].to_string())
    .bind(&bucket)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(keyed, 1);
}

#[tokio::test]
async fn concurrent_cohort_triggers_partition_instead_of_duplicating() {
    let pool = fresh_pool().await;
    let ctx = test_ctx(pool.clone()).await;

    let mut tenants = Vec::new();
    for _ in 0..20 {
        tenants.push(create_tenant(&pool, "enterprise").await);
    }

    let ctx_a = ctx.clone();
    let ctx_b = ctx.clone();
    tokio::join!(
        SchedulerOrchestrator::cohort_enqueue(&ctx_a, TenantCohort::HighValue),
        SchedulerOrchestrator::cohort_enqueue(&ctx_b, TenantCohort::HighValue),
    );

    assert_eq!(count_jobs_for(&pool, &tenants).await, 60);
}

#[tokio::test]
async fn cohorts_only_touch_their_own_tiers() {
    let pool = fresh_pool().await;
    let ctx = test_ctx(pool.clone()).await;

    let growth = create_tenant(&pool, "growth").await;
    let trial = create_tenant(&pool, "trial").await;
    let enterprise = create_tenant(&pool, "enterprise").await;

    SchedulerOrchestrator::cohort_enqueue(&ctx, TenantCohort::Active).await;

    assert_eq!(count_jobs_for(&pool, &[growth]).await, 3);
    assert_eq!(count_jobs_for(&pool, &[trial]).await, 0);
    assert_eq!(count_jobs_for(&pool, &[enterprise]).await, 0);
}

#[tokio::test]
async fn billing_sweep_targets_due_subscriptions_with_authorization() {
    let pool = fresh_pool().await;
    let ctx = test_ctx(pool.clone()).await;
    let tenant = create_tenant(&pool, "pro").await;

    let due = Uuid::new_v4();
    let not_due = Uuid::new_v4();
    let no_auth = Uuid::new_v4();

    for (id, next_payment, authorization) in [
        (due, "NOW() - INTERVAL '1 day'", Some("AUTH_x")),
        (not_due, "NOW() + INTERVAL '20 days'", Some("AUTH_y")),
        (no_auth, "NOW() - INTERVAL '1 day'", None),
    ] {
        let sql = format!(
            "INSERT INTO tenant_subscriptions \
                 (id, tenant_id, tier, status, customer_email, authorization_code, next_payment_date) \
             VALUES ($1, $2, 'pro', 'active', 'x@example.com', $3, {next_payment})"
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(tenant)
            .bind(authorization)
            .execute(&pool)
            .await
            .unwrap();
    }

    let enqueued = SchedulerOrchestrator::billing_sweep(&ctx).await.unwrap();
    assert_eq!(enqueued, 1);

    let payload: serde_json::Value = sqlx::query_scalar(
        "SELECT payload FROM background_jobs WHERE job_type = 'recurring_billing'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(payload["subscription_id"], due.to_string());
}

#[tokio::test]
async fn remediation_sweep_enqueues_per_aws_connection() {
    let pool = fresh_pool().await;
    let ctx = test_ctx(pool.clone()).await;
    let tenant = create_tenant(&pool, "pro").await;

    let connection_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO aws_connections \
             (id, tenant_id, name, region, aws_account_id, access_key_id, secret_access_key) \
         VALUES ($1, $2, 'prod', 'eu-west-1', '123456789012', 'AKID', 'secret')",
    )
    .bind(connection_id)
    .bind(tenant)
    .execute(&pool)
    .await
    .unwrap();

    let enqueued = SchedulerOrchestrator::remediation_sweep(&ctx).await.unwrap();
    assert_eq!(enqueued, 1);

    let payload: serde_json::Value = sqlx::query_scalar(
        "SELECT payload FROM background_jobs WHERE job_type = 'remediation'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(payload["connection_id"], connection_id.to_string());
    assert_eq!(payload["region"], "eu-west-1");
}
