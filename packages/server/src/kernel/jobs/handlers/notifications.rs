//! Notification dispatch.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::db::session::TenantSession;
use crate::domains::notifications::Severity;
use crate::kernel::jobs::processor::required_field;
use crate::kernel::jobs::{BackgroundJob, JobHandler, JobType};
use crate::kernel::AppContext;

pub struct NotificationHandler {
    ctx: Arc<AppContext>,
}

impl NotificationHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        _session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let payload = job.payload.as_ref();
        let message = required_field(payload, "message", JobType::Notification)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let title = payload
            .and_then(|p| p.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("Skysweep Notification")
            .to_string();
        let severity = payload
            .and_then(|p| p.get("severity"))
            .and_then(Value::as_str)
            .map(Severity::parse)
            .unwrap_or(Severity::Info);

        let Some(sink) = &self.ctx.notifications else {
            return Ok(json!({ "status": "skipped", "reason": "slack_not_configured" }));
        };

        let success = sink.send_alert(&title, &message, severity).await?;
        Ok(json!({ "status": "completed", "success": success }))
    }
}
