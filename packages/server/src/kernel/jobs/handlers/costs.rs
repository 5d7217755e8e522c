//! Cost pipeline handlers: ingestion plus the reporting-side jobs that run
//! over the ingested records.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::db::session::TenantSession;
use crate::domains::connections::{
    build_adapter, connections_for_tenant, mark_ingest_error, mark_ingested, CloudConnection,
    Granularity,
};
use crate::domains::costs::{
    ingestion_window, save_records_stream, upsert_cloud_account, IngestSummary,
};
use crate::kernel::jobs::{BackgroundJob, JobError, JobHandler};
use crate::kernel::AppContext;

pub struct CostIngestionHandler {
    #[allow(dead_code)]
    ctx: Arc<AppContext>,
}

impl CostIngestionHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    async fn ingest_connection(
        session: &mut TenantSession<'_>,
        tenant_id: Uuid,
        connection: &CloudConnection,
    ) -> Result<IngestSummary> {
        let adapter = build_adapter(connection, None);
        let (start, end) = ingestion_window(Utc::now());
        let records = adapter
            .stream_cost_and_usage(start, end, Granularity::Hourly)
            .await?;

        let conn = session.executor("INSERT INTO cost_records")?;
        upsert_cloud_account(&mut *conn, connection).await?;
        let summary = save_records_stream(&mut *conn, tenant_id, connection.id(), records).await?;
        mark_ingested(&mut *conn, connection).await?;
        Ok(summary)
    }
}

#[async_trait]
impl JobHandler for CostIngestionHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let tenant_id = job
            .tenant_id
            .ok_or_else(|| JobError::InvalidPayload("tenant_id required for cost_ingestion".into()))?;

        let connections = connections_for_tenant(session, tenant_id).await?;
        if connections.is_empty() {
            return Ok(json!({ "status": "skipped", "reason": "no_active_connections" }));
        }

        // Each connection ingests independently; one broken provider must
        // not starve the others.
        let mut details = Vec::new();
        for connection in &connections {
            match Self::ingest_connection(session, tenant_id, connection).await {
                Ok(summary) => details.push(json!({
                    "connection_id": connection.id().to_string(),
                    "provider": connection.provider().as_str(),
                    "records_ingested": summary.records_saved,
                    "total_cost": summary.total_cost_usd,
                })),
                Err(e) => {
                    warn!(connection_id = %connection.id(), error = %e, "cost_ingestion_connection_failed");
                    if let Ok(conn) = session.executor("UPDATE aws_connections") {
                        let _ = mark_ingest_error(&mut *conn, connection, &e.to_string()).await;
                    }
                    details.push(json!({
                        "connection_id": connection.id().to_string(),
                        "status": "failed",
                        "error": e.to_string(),
                    }));
                }
            }
        }

        Ok(json!({
            "status": "completed",
            "connections_processed": connections.len(),
            "details": details,
        }))
    }
}

/// Projected month-end spend from the trailing 30 days of records.
pub struct CostForecastHandler {
    #[allow(dead_code)]
    ctx: Arc<AppContext>,
}

impl CostForecastHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for CostForecastHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let tenant_id = job
            .tenant_id
            .ok_or_else(|| JobError::InvalidPayload("tenant_id required for cost_forecast".into()))?;

        let sql = "SELECT COALESCE(SUM(cost_usd), 0) FROM cost_records \
                   WHERE tenant_id = $1 AND occurred_at >= NOW() - INTERVAL '30 days'";
        let trailing: Decimal = sqlx::query_scalar(sql)
            .bind(tenant_id)
            .fetch_one(session.executor(sql)?)
            .await?;

        let daily_average = trailing / Decimal::from(30);
        Ok(json!({
            "status": "completed",
            "trailing_30d_usd": trailing.round_dp(2),
            "projected_30d_usd": (daily_average * Decimal::from(30)).round_dp(2),
            "daily_average_usd": daily_average.round_dp(2),
        }))
    }
}

/// Export of a tenant's records over a requested window.
pub struct CostExportHandler {
    #[allow(dead_code)]
    ctx: Arc<AppContext>,
}

impl CostExportHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for CostExportHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let tenant_id = job
            .tenant_id
            .ok_or_else(|| JobError::InvalidPayload("tenant_id required for cost_export".into()))?;
        let days = job
            .payload
            .as_ref()
            .and_then(|p| p.get("days"))
            .and_then(Value::as_i64)
            .unwrap_or(30);

        let sql = "SELECT COUNT(*) FROM cost_records \
                   WHERE tenant_id = $1 AND occurred_at >= NOW() - ($2 || ' days')::INTERVAL";
        let rows: i64 = sqlx::query_scalar(sql)
            .bind(tenant_id)
            .bind(days.to_string())
            .fetch_one(session.executor(sql)?)
            .await?;

        Ok(json!({
            "status": "completed",
            "rows_exported": rows,
            "window_days": days,
        }))
    }
}

/// Daily per-service rollup used by the reporting surfaces.
pub struct CostAggregationHandler {
    #[allow(dead_code)]
    ctx: Arc<AppContext>,
}

impl CostAggregationHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for CostAggregationHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let tenant_id = job.tenant_id.ok_or_else(|| {
            JobError::InvalidPayload("tenant_id required for cost_aggregation".into())
        })?;

        let sql = "INSERT INTO cost_daily_aggregates (tenant_id, day, service, cost_usd) \
                   SELECT tenant_id, date_trunc('day', occurred_at), service, SUM(cost_usd) \
                   FROM cost_records \
                   WHERE tenant_id = $1 AND occurred_at >= NOW() - INTERVAL '7 days' \
                   GROUP BY tenant_id, date_trunc('day', occurred_at), service \
                   ON CONFLICT (tenant_id, day, service) \
                     DO UPDATE SET cost_usd = EXCLUDED.cost_usd";
        let result = sqlx::query(sql)
            .bind(tenant_id)
            .execute(session.executor(sql)?)
            .await?;

        Ok(json!({
            "status": "completed",
            "aggregates_written": result.rows_affected(),
        }))
    }
}

/// Summary report over the trailing month.
pub struct ReportGenerationHandler {
    #[allow(dead_code)]
    ctx: Arc<AppContext>,
}

impl ReportGenerationHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for ReportGenerationHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let tenant_id = job.tenant_id.ok_or_else(|| {
            JobError::InvalidPayload("tenant_id required for report_generation".into())
        })?;

        let sql = "SELECT service, SUM(cost_usd) AS cost FROM cost_records \
                   WHERE tenant_id = $1 AND occurred_at >= NOW() - INTERVAL '30 days' \
                   GROUP BY service ORDER BY cost DESC LIMIT 10";
        let rows = sqlx::query_as::<_, (String, Decimal)>(sql)
            .bind(tenant_id)
            .fetch_all(session.executor(sql)?)
            .await?;

        let top_services: Vec<Value> = rows
            .iter()
            .map(|(service, cost)| json!({ "service": service, "cost_usd": cost.round_dp(2) }))
            .collect();

        Ok(json!({
            "status": "completed",
            "period_days": 30,
            "top_services": top_services,
        }))
    }
}
