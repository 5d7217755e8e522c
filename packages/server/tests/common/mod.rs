//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared across the whole test run; every test
//! gets its own freshly migrated database so concurrent tests cannot see
//! each other's jobs.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedTestInfra {
    base_url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;
        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;

        Ok(Self {
            base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
            _postgres: postgres,
        })
    }
}

/// A freshly created, fully migrated database for one test.
pub async fn fresh_pool() -> PgPool {
    let infra = SHARED_INFRA
        .get_or_try_init(SharedTestInfra::init)
        .await
        .expect("test infrastructure");

    let db_name = format!("test_{}", Uuid::new_v4().simple());
    let admin = PgPool::connect(&format!("{}/postgres", infra.base_url))
        .await
        .expect("admin connection");
    sqlx::query(&format!(r#"CREATE DATABASE "{db_name}""#))
        .execute(&admin)
        .await
        .expect("create test database");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&format!("{}/{db_name}", infra.base_url))
        .await
        .expect("test database connection");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

/// Insert a tenant with the given plan and return its id.
pub async fn create_tenant(pool: &PgPool, plan: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO tenants (id, name, plan) VALUES ($1, $2, $3::plan_tier)")
        .bind(id)
        .bind(format!("tenant-{id}"))
        .bind(plan)
        .execute(pool)
        .await
        .expect("insert tenant");
    id
}
