//! Remediation sweep over a tenant's connections.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::session::TenantSession;
use crate::domains::connections::connections_for_tenant;
use crate::domains::remediation::{RemediationEngine, RemediationSettings};
use crate::kernel::jobs::{BackgroundJob, JobError, JobHandler};
use crate::kernel::AppContext;

pub struct RemediationHandler {
    ctx: Arc<AppContext>,
}

impl RemediationHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for RemediationHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let tenant_id = job
            .tenant_id
            .ok_or_else(|| JobError::InvalidPayload("tenant_id required for remediation".into()))?;

        let payload = job.payload.as_ref();
        let target_connection = payload
            .and_then(|p| p.get("connection_id"))
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok());
        let region = payload
            .and_then(|p| p.get("region"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut connections = connections_for_tenant(session, tenant_id).await?;
        if let Some(target) = target_connection {
            connections.retain(|c| c.id() == target);
        }
        let Some(connection) = connections.first() else {
            return Ok(json!({ "status": "skipped", "reason": "no_cloud_connections" }));
        };

        let settings = RemediationSettings::load(session, tenant_id).await?;
        let engine = RemediationEngine::new(
            self.ctx.action_limiter.clone(),
            Duration::from_secs(self.ctx.config.zombie_plugin_timeout_seconds),
        );

        let report = engine.sweep(connection, &settings, region.as_deref()).await;

        Ok(json!({
            "status": "completed",
            "mode": report.mode,
            "scanned": report.scanned,
            "eligible": report.eligible,
            "auto_executed": report.auto_executed,
            "rate_limited": report.rate_limited,
            "failed": report.failed,
        }))
    }
}
