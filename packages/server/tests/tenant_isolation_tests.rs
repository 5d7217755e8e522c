//! Row-level isolation enforcement tests.

mod common;

use skysweep_core::db::session::{SessionError, TenantSession};
use skysweep_core::kernel::jobs::{EnqueueSpec, JobSort, JobStore, JobType};

use common::{create_tenant, fresh_pool};

#[tokio::test]
async fn request_session_without_tenant_refuses_user_table_queries() {
    let pool = fresh_pool().await;
    let mut conn = pool.acquire().await.unwrap();

    let mut session = TenantSession::for_request(&mut conn, None).await.unwrap();
    assert!(!session.has_rls_context());

    let err = session
        .executor("SELECT id FROM background_jobs LIMIT 1")
        .err()
        .expect("statement must be refused");
    assert!(matches!(err, SessionError::RlsContextMissing));
}

#[tokio::test]
async fn request_session_without_tenant_still_allows_internal_probes() {
    let pool = fresh_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    let mut session = TenantSession::for_request(&mut conn, None).await.unwrap();

    let conn = session.executor("SELECT 1").expect("health probe allowed");
    sqlx::query("SELECT 1").execute(conn).await.unwrap();

    let conn = session
        .executor("SELECT id, plan FROM tenants LIMIT 1")
        .expect("identity lookup allowed");
    sqlx::query("SELECT id, plan FROM tenants LIMIT 1")
        .fetch_all(conn)
        .await
        .unwrap();
}

#[tokio::test]
async fn tenant_session_reads_its_own_jobs() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;

    store
        .enqueue(EnqueueSpec::new(JobType::ZombieScan).tenant(tenant))
        .await
        .unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let mut session = TenantSession::for_request(&mut conn, Some(tenant))
        .await
        .unwrap();
    assert!(session.has_rls_context());
    assert_eq!(session.tenant_id(), Some(tenant));

    let jobs = JobStore::list_by_tenant(
        &mut session,
        tenant,
        None,
        JobSort::CreatedAt,
        true,
        20,
    )
    .await
    .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].tenant_id, Some(tenant));
}

#[tokio::test]
async fn status_counts_cover_only_non_deleted_rows() {
    let pool = fresh_pool().await;
    let store = JobStore::new(pool.clone());
    let tenant = create_tenant(&pool, "growth").await;

    let keep = store
        .enqueue(EnqueueSpec::new(JobType::ZombieScan).tenant(tenant))
        .await
        .unwrap()
        .job()
        .id;
    let delete = store
        .enqueue(EnqueueSpec::new(JobType::Notification).tenant(tenant))
        .await
        .unwrap()
        .job()
        .id;
    store.soft_delete(delete).await.unwrap();
    let _ = keep;

    let mut conn = pool.acquire().await.unwrap();
    let mut session = TenantSession::for_request(&mut conn, Some(tenant))
        .await
        .unwrap();
    let counts = JobStore::count_by_status(&mut session, tenant).await.unwrap();

    assert_eq!(counts.pending, 1);
    assert_eq!(counts.running, 0);
    assert_eq!(counts.dead_letter, 0);
}

#[tokio::test]
async fn system_session_is_an_explicit_opt_out() {
    let pool = fresh_pool().await;
    let mut conn = pool.acquire().await.unwrap();

    let mut session = TenantSession::system(&mut conn);
    assert!(session.has_rls_context());
    assert!(session.tenant_id().is_none());

    let conn = session
        .executor("SELECT COUNT(*) FROM background_jobs")
        .expect("system sessions may touch user tables");
    let _: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM background_jobs")
        .fetch_one(conn)
        .await
        .unwrap();
}
