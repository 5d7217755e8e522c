//! Recurring billing and dunning.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::session::TenantSession;
use crate::domains::billing::{plan_price_usd, SubscriptionStatus, TenantSubscription};
use crate::domains::notifications::Severity;
use crate::kernel::jobs::{BackgroundJob, JobError, JobHandler, JobType};
use crate::kernel::AppContext;

fn subscription_id_from(job: &BackgroundJob, job_type: JobType) -> Result<Uuid> {
    let raw = job
        .payload
        .as_ref()
        .and_then(|p| p.get("subscription_id"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            JobError::InvalidPayload(format!("subscription_id required for {job_type}"))
        })?;
    Uuid::parse_str(raw).map_err(|_| {
        JobError::InvalidPayload(format!("subscription_id required for {job_type}")).into()
    })
}

/// Charges one subscription's renewal.
pub struct RecurringBillingHandler {
    ctx: Arc<AppContext>,
}

impl RecurringBillingHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for RecurringBillingHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let subscription_id = subscription_id_from(job, JobType::RecurringBilling)?;

        let find_sql = "SELECT FROM tenant_subscriptions";
        let Some(subscription) =
            TenantSubscription::find_by_id(session.executor(find_sql)?, subscription_id).await?
        else {
            return Ok(json!({ "status": "failed", "reason": "subscription_not_found" }));
        };

        if subscription.status != SubscriptionStatus::Active {
            return Ok(json!({
                "status": "skipped",
                "reason": format!("subscription_status_is_{}", subscription.status.as_str()),
            }));
        }
        if subscription.authorization_code.is_none() {
            return Err(anyhow!("charge failed: authorization missing"));
        }

        // A tier without a pricing row is a billing-configuration bug;
        // charging zero would silently mask it.
        let price_sql = "SELECT price_usd FROM pricing_plans";
        let price = plan_price_usd(session.executor(price_sql)?, subscription.tier)
            .await?
            .ok_or_else(|| {
                anyhow!("pricing plan missing for tier {}", subscription.tier.as_str())
            })?;

        let gateway = self
            .ctx
            .billing
            .as_ref()
            .ok_or_else(|| anyhow!("billing gateway not configured"))?;

        if gateway.charge_renewal(&subscription, price).await? {
            let advance_sql = "UPDATE tenant_subscriptions";
            subscription
                .advance_renewal(session.executor(advance_sql)?)
                .await?;
            Ok(json!({ "status": "completed", "amount_billed_usd": price }))
        } else {
            Err(anyhow!("charge failed: gateway declined renewal"))
        }
    }
}

/// Payment-retry notices for past-due subscriptions.
pub struct DunningHandler {
    ctx: Arc<AppContext>,
}

impl DunningHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for DunningHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let subscription_id = subscription_id_from(job, JobType::Dunning)?;

        let find_sql = "SELECT FROM tenant_subscriptions";
        let Some(subscription) =
            TenantSubscription::find_by_id(session.executor(find_sql)?, subscription_id).await?
        else {
            return Ok(json!({ "status": "failed", "reason": "subscription_not_found" }));
        };

        let mark_sql = "UPDATE tenant_subscriptions SET status = 'past_due' WHERE id = $1";
        sqlx::query(mark_sql)
            .bind(subscription.id)
            .execute(session.executor(mark_sql)?)
            .await?;

        let notified = match &self.ctx.notifications {
            Some(sink) => sink
                .send_alert(
                    "Payment failed",
                    &format!(
                        "Renewal for subscription {} could not be charged; the account is past due.",
                        subscription.id
                    ),
                    Severity::Critical,
                )
                .await
                .unwrap_or(false),
            None => false,
        };

        Ok(json!({ "status": "completed", "notified": notified }))
    }
}
