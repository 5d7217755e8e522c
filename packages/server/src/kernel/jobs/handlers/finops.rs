//! FinOps analysis: summarize 30 days of usage and hand it to the analyzer.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::warn;

use crate::db::session::TenantSession;
use crate::domains::connections::{build_adapter, connections_for_tenant, Granularity};
use crate::kernel::jobs::{BackgroundJob, JobError, JobHandler};
use crate::kernel::AppContext;

const LOOKBACK_DAYS: i64 = 30;

pub struct FinOpsAnalysisHandler {
    ctx: Arc<AppContext>,
}

impl FinOpsAnalysisHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for FinOpsAnalysisHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let tenant_id = job
            .tenant_id
            .ok_or_else(|| JobError::InvalidPayload("tenant_id required for finops_analysis".into()))?;

        let connections = connections_for_tenant(session, tenant_id).await?;
        if connections.is_empty() {
            return Ok(json!({ "status": "skipped", "reason": "no_cloud_connections" }));
        }

        let end = Utc::now();
        let start = end - chrono::Duration::days(LOOKBACK_DAYS);

        // Normalized usage summary across every connection. A connection
        // whose adapter fails is reported, not fatal.
        let mut total_cost = Decimal::ZERO;
        let mut by_service: std::collections::HashMap<String, Decimal> = Default::default();
        let mut record_count = 0u64;
        let mut failed_connections = Vec::new();

        for connection in &connections {
            let adapter = build_adapter(connection, None);
            let mut records = match adapter
                .stream_cost_and_usage(start, end, Granularity::Daily)
                .await
            {
                Ok(records) => records,
                Err(e) => {
                    warn!(connection_id = %connection.id(), error = %e, "finops_usage_fetch_failed");
                    failed_connections.push(connection.id().to_string());
                    continue;
                }
            };

            while let Some(record) = records.next().await {
                match record {
                    Ok(record) => {
                        total_cost += record.cost_usd;
                        *by_service.entry(record.service).or_default() += record.cost_usd;
                        record_count += 1;
                    }
                    Err(e) => {
                        warn!(connection_id = %connection.id(), error = %e, "finops_usage_record_failed");
                        failed_connections.push(connection.id().to_string());
                        break;
                    }
                }
            }
        }

        let summary = json!({
            "period_days": LOOKBACK_DAYS,
            "total_cost_usd": total_cost.round_dp(2),
            "by_service": by_service
                .iter()
                .map(|(service, cost)| json!({ "service": service, "cost_usd": cost.round_dp(2) }))
                .collect::<Vec<_>>(),
            "record_count": record_count,
            "connections": connections.len(),
            "failed_connections": failed_connections,
        });

        let Some(analyzer) = &self.ctx.analyzer else {
            return Ok(json!({
                "status": "skipped",
                "reason": "analyzer_not_configured",
                "summary": summary,
            }));
        };

        let analysis = analyzer.analyze(&summary, tenant_id).await?;
        Ok(json!({
            "status": "completed",
            "analysis_length": analysis.len(),
            "summary": summary,
        }))
    }
}
