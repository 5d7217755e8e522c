//! Cost-and-usage persistence.
//!
//! Ingestion is idempotent: records are keyed by their natural identity
//! (account, instant, service, resource) and re-running a window is a no-op.
//! That property is what lets the ingestion job be retried blindly.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::domains::connections::{CloudConnection, UsageRecord};

/// Rows are flushed in batches of this size.
const INSERT_BATCH: usize = 500;

/// Summary of one connection's ingestion run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub records_seen: u64,
    pub records_saved: u64,
    pub total_cost_usd: Decimal,
}

/// Upsert the `cloud_accounts` row mirroring a connection, keyed by the
/// connection id. Satisfies the FK for cost records and powers filtering.
pub async fn upsert_cloud_account(
    conn: &mut PgConnection,
    connection: &CloudConnection,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO cloud_accounts (id, tenant_id, provider, name, is_active, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, TRUE, NOW(), NOW()) \
         ON CONFLICT (id) DO UPDATE SET \
             provider = EXCLUDED.provider, \
             name = EXCLUDED.name, \
             updated_at = NOW()",
    )
    .bind(connection.id())
    .bind(connection.tenant_id())
    .bind(connection.provider().as_str())
    .bind(connection.name())
    .execute(conn)
    .await?;
    Ok(())
}

/// Drain a usage-record stream into `cost_records`, batching inserts.
///
/// Returns totals for reporting. Duplicate records (same natural key) are
/// silently skipped.
pub async fn save_records_stream(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    account_id: Uuid,
    mut records: BoxStream<'_, Result<UsageRecord>>,
) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    let mut batch: Vec<UsageRecord> = Vec::with_capacity(INSERT_BATCH);

    while let Some(record) = records.next().await {
        let record = record?;
        summary.records_seen += 1;
        summary.total_cost_usd += record.cost_usd;
        batch.push(record);

        if batch.len() >= INSERT_BATCH {
            summary.records_saved += flush_batch(conn, tenant_id, account_id, &batch).await?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        summary.records_saved += flush_batch(conn, tenant_id, account_id, &batch).await?;
    }

    Ok(summary)
}

async fn flush_batch(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    account_id: Uuid,
    batch: &[UsageRecord],
) -> Result<u64> {
    let mut saved = 0u64;
    for record in batch {
        let result = sqlx::query(
            "INSERT INTO cost_records \
                 (id, tenant_id, account_id, occurred_at, service, resource_id, region, \
                  cost_usd, usage_amount, usage_unit, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW()) \
             ON CONFLICT (account_id, occurred_at, service, resource_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(account_id)
        .bind(record.occurred_at)
        .bind(&record.service)
        .bind(record.resource_id.as_deref().unwrap_or(""))
        .bind(&record.region)
        .bind(record.cost_usd)
        .bind(&record.usage_amount)
        .bind(&record.usage_unit)
        .execute(&mut *conn)
        .await?;
        saved += result.rows_affected();
    }
    Ok(saved)
}

/// Ingestion window: trailing seven days.
pub fn ingestion_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (now - chrono::Duration::days(7), now)
}
