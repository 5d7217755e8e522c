//! Zombie scan and its async analysis follow-up.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::db::session::TenantSession;
use crate::domains::zombies::CheckpointFn;
use crate::kernel::jobs::{BackgroundJob, JobError, JobHandler, JobStore};
use crate::kernel::AppContext;

pub struct ZombieScanHandler {
    ctx: Arc<AppContext>,
}

impl ZombieScanHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Durable checkpoint: each completed category is written into the job's
    /// payload so a crashed scan surfaces partial work to the next attempt.
    fn checkpoint_callback(store: JobStore, job_id: uuid::Uuid) -> CheckpointFn {
        Arc::new(move |category, items| {
            let store = store.clone();
            Box::pin(async move {
                let items = serde_json::to_value(&items)?;
                store.checkpoint_partial_scan(job_id, &category, &items).await
            })
        })
    }
}

#[async_trait]
impl JobHandler for ZombieScanHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let tenant_id = job
            .tenant_id
            .ok_or_else(|| JobError::InvalidPayload("tenant_id required for zombie_scan".into()))?;

        let payload = job.payload.as_ref();
        let region = payload
            .and_then(|p| p.get("region"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let analyze = payload
            .and_then(|p| p.get("analyze"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let checkpoint = Self::checkpoint_callback(self.ctx.store.clone(), job.id);
        let report = self
            .ctx
            .zombie_service()
            .scan_for_tenant(session, tenant_id, region.as_deref(), analyze, Some(checkpoint))
            .await?;

        if report.error.is_some() {
            return Ok(json!({ "status": "skipped", "reason": "no_connections_found" }));
        }

        Ok(json!({
            "status": "completed",
            "zombies_found": report.zombies_found(),
            "total_waste": report.total_monthly_waste,
            "results": report.to_value(),
        }))
    }
}

pub struct ZombieAnalysisHandler {
    ctx: Arc<AppContext>,
}

impl ZombieAnalysisHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for ZombieAnalysisHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        _session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let tenant_id = job.tenant_id.ok_or_else(|| {
            JobError::InvalidPayload("tenant_id required for zombie_analysis".into())
        })?;
        let zombies = job
            .payload
            .as_ref()
            .and_then(|p| p.get("zombies"))
            .cloned()
            .ok_or_else(|| JobError::InvalidPayload("zombies required for zombie_analysis".into()))?;

        let Some(analyzer) = &self.ctx.analyzer else {
            return Ok(json!({ "status": "skipped", "reason": "analyzer_not_configured" }));
        };

        let analysis = analyzer.analyze(&zombies, tenant_id).await?;
        Ok(json!({ "status": "completed", "analysis": analysis }))
    }
}
