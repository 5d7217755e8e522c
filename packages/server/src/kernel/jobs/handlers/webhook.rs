//! Durable webhook retry.
//!
//! Webhooks are stored as jobs before processing so a crash cannot lose
//! them. Paystack events route to the provider sub-handler (the signature
//! was verified when the webhook was first received); anything else is
//! replayed as a plain POST.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::db::session::TenantSession;
use crate::kernel::jobs::processor::required_field;
use crate::kernel::jobs::{
    BackgroundJob, EnqueueOutcome, EnqueueSpec, JobHandler, JobStore, JobType,
};
use crate::kernel::AppContext;

const GENERIC_POST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deterministic key for a webhook delivery, so the same event is stored at
/// most once.
pub fn webhook_idempotency_key(provider: &str, event_type: &str, reference: &str) -> String {
    let digest = Sha256::digest(format!("{provider}:{event_type}:{reference}").as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Store a webhook for durable processing. Duplicate deliveries collapse
/// onto the existing job. `max_attempts` comes from `WEBHOOK_MAX_ATTEMPTS`;
/// webhooks are revenue-critical and retry more than ordinary jobs.
pub async fn store_webhook(
    store: &JobStore,
    provider: &str,
    event_type: &str,
    payload: Value,
    reference: &str,
    max_attempts: i32,
) -> Result<EnqueueOutcome> {
    let idempotency_key = webhook_idempotency_key(provider, event_type, reference);

    let spec = EnqueueSpec::new(JobType::WebhookRetry)
        .max_attempts(max_attempts)
        .dedup_key(format!("webhook:{idempotency_key}"))
        .payload(json!({
            "provider": provider,
            "event_type": event_type,
            "payload": payload,
            "idempotency_key": idempotency_key,
            "reference": reference,
        }));

    let outcome = store.enqueue(spec).await?;
    info!(
        provider,
        event_type,
        idempotency_key,
        duplicate = !outcome.is_created(),
        "webhook_stored"
    );
    Ok(outcome)
}

pub struct WebhookRetryHandler {
    http: reqwest::Client,
    #[allow(dead_code)]
    ctx: Arc<AppContext>,
}

impl WebhookRetryHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            http: reqwest::Client::new(),
            ctx,
        }
    }

    /// Replay a Paystack event against our subscription state. Signature
    /// verification is intentionally skipped: it already passed when the
    /// webhook was first received.
    async fn process_paystack(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let payload = job.payload.as_ref();
        let webhook = payload
            .and_then(|p| p.get("payload"))
            .cloned()
            .unwrap_or(Value::Null);
        let event = webhook["event"]
            .as_str()
            .or_else(|| payload.and_then(|p| p.get("event_type")).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        let data = &webhook["data"];

        let subscription_id = data["metadata"]["subscription_id"]
            .as_str()
            .and_then(|raw| Uuid::parse_str(raw).ok());

        match (event.as_str(), subscription_id) {
            ("subscription.create", Some(id)) => {
                let authorization = data["authorization"]["authorization_code"].as_str();
                let sql = "UPDATE tenant_subscriptions \
                           SET status = 'active', \
                               authorization_code = COALESCE($2, authorization_code) \
                           WHERE id = $1";
                sqlx::query(sql)
                    .bind(id)
                    .bind(authorization)
                    .execute(session.executor(sql)?)
                    .await?;
            }
            ("charge.success", Some(id)) => {
                let sql = "UPDATE tenant_subscriptions \
                           SET status = 'active', \
                               next_payment_date = COALESCE(next_payment_date, NOW()) + INTERVAL '1 month' \
                           WHERE id = $1";
                sqlx::query(sql).bind(id).execute(session.executor(sql)?).await?;
            }
            ("subscription.disable", Some(id)) => {
                let sql = "UPDATE tenant_subscriptions SET status = 'cancelled' WHERE id = $1";
                sqlx::query(sql).bind(id).execute(session.executor(sql)?).await?;
            }
            ("invoice.payment_failed", Some(id)) => {
                let sql = "UPDATE tenant_subscriptions SET status = 'past_due' WHERE id = $1";
                sqlx::query(sql).bind(id).execute(session.executor(sql)?).await?;
            }
            _ => {
                return Ok(json!({
                    "status": "ignored",
                    "reason": format!("Unknown event type: {event}"),
                }));
            }
        }

        Ok(json!({ "status": "processed", "event": event }))
    }

    /// Generic replay: POST `payload.data` to `payload.url` with
    /// `payload.headers`. Target-side idempotency is assumed.
    async fn process_generic(&self, job: &BackgroundJob) -> Result<Value> {
        let payload = job.payload.as_ref();
        let url = required_field(payload, "url", JobType::WebhookRetry)?
            .as_str()
            .ok_or_else(|| anyhow!("url required for webhook_retry"))?
            .to_string();
        let data = payload
            .and_then(|p| p.get("data"))
            .cloned()
            .unwrap_or(Value::Null);

        let mut request = self
            .http
            .post(&url)
            .timeout(GENERIC_POST_TIMEOUT)
            .json(&data);
        if let Some(headers) = payload.and_then(|p| p.get("headers")).and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }

        let response = request.send().await?;
        let status = response.status();
        response.error_for_status_ref().map_err(|e| anyhow!(e))?;

        Ok(json!({ "status": "completed", "status_code": status.as_u16() }))
    }
}

#[async_trait]
impl JobHandler for WebhookRetryHandler {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value> {
        let provider = job
            .payload
            .as_ref()
            .and_then(|p| p.get("provider"))
            .and_then(Value::as_str)
            .unwrap_or("generic");

        match provider {
            "paystack" => self.process_paystack(job, session).await,
            _ => self.process_generic(job).await,
        }
    }
}
