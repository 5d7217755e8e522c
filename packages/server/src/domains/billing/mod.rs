//! Subscriptions and the Paystack billing gateway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, PgConnection};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::domains::tenancy::PlanTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct TenantSubscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub tier: PlanTier,
    pub status: SubscriptionStatus,
    pub customer_email: String,
    /// Paystack charge authorization; renewals cannot run without it.
    pub authorization_code: Option<String>,
    pub next_payment_date: Option<DateTime<Utc>>,
}

impl TenantSubscription {
    pub async fn find_by_id(
        conn: &mut PgConnection,
        id: Uuid,
    ) -> Result<Option<TenantSubscription>> {
        let subscription = sqlx::query_as::<_, TenantSubscription>(
            "SELECT id, tenant_id, tier, status, customer_email, authorization_code, \
                    next_payment_date \
             FROM tenant_subscriptions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;
        Ok(subscription)
    }

    /// Push the renewal date one billing period out after a successful
    /// charge.
    pub async fn advance_renewal(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            "UPDATE tenant_subscriptions \
             SET next_payment_date = COALESCE(next_payment_date, NOW()) + INTERVAL '1 month' \
             WHERE id = $1",
        )
        .bind(self.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

/// Monthly price of a tier, from the pricing table. `None` when no plan row
/// exists for the tier.
pub async fn plan_price_usd(conn: &mut PgConnection, tier: PlanTier) -> Result<Option<Decimal>> {
    let price = sqlx::query_scalar::<_, Decimal>(
        "SELECT price_usd FROM pricing_plans WHERE tier = $1",
    )
    .bind(tier)
    .fetch_optional(conn)
    .await?;
    Ok(price)
}

/// Charge capability for renewals. Returns whether the charge went through.
#[async_trait]
pub trait BillingGateway: Send + Sync {
    async fn charge_renewal(
        &self,
        subscription: &TenantSubscription,
        amount_usd: Decimal,
    ) -> Result<bool>;
}

/// Paystack `charge_authorization` gateway.
pub struct PaystackGateway {
    http: reqwest::Client,
    secret_key: String,
}

impl PaystackGateway {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key: secret_key.into(),
        }
    }

    pub fn from_config(config: &Config) -> Option<Arc<dyn BillingGateway>> {
        config
            .paystack_secret_key
            .as_ref()
            .map(|key| Arc::new(PaystackGateway::new(key.clone())) as Arc<dyn BillingGateway>)
    }
}

#[async_trait]
impl BillingGateway for PaystackGateway {
    async fn charge_renewal(
        &self,
        subscription: &TenantSubscription,
        amount_usd: Decimal,
    ) -> Result<bool> {
        let authorization_code = subscription
            .authorization_code
            .as_deref()
            .ok_or_else(|| anyhow!("subscription has no stored authorization"))?;

        // Paystack amounts are integer subunits.
        let amount_subunits = (amount_usd * Decimal::from(100))
            .round()
            .to_i64()
            .ok_or_else(|| anyhow!("charge amount out of range: {amount_usd}"))?;

        let response: serde_json::Value = self
            .http
            .post("https://api.paystack.co/transaction/charge_authorization")
            .timeout(Duration::from_secs(30))
            .bearer_auth(&self.secret_key)
            .json(&json!({
                "authorization_code": authorization_code,
                "email": subscription.customer_email,
                "amount": amount_subunits,
                "metadata": {
                    "subscription_id": subscription.id.to_string(),
                    "tenant_id": subscription.tenant_id.to_string(),
                    "reason": "renewal"
                }
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let charged = response["data"]["status"].as_str() == Some("success");
        info!(
            subscription_id = %subscription.id,
            charged,
            "paystack_renewal_charge"
        );
        Ok(charged)
    }
}
