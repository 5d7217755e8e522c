//! Remediation: policy-constrained cleanup of detected waste.
//!
//! Sweeps rescan a connection and act on high-confidence findings whose
//! action the tenant has allowed. Action volume is capped per tenant, action
//! type and hour; the cap is enforced through a shared store when Redis is
//! configured and in-process otherwise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::FromRow;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::session::TenantSession;
use crate::domains::connections::{build_adapter, CloudConnection};
use crate::domains::zombies::{detector_for_connection, WasteItem};

/// At most this many actions per tenant, action type and hour.
pub const MAX_ACTIONS_PER_HOUR: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "remediation_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RemediationMode {
    /// Record what would be done, execute nothing.
    Observe,
    /// Execute allowed actions automatically.
    Auto,
}

#[derive(FromRow, Debug, Clone)]
pub struct RemediationSettings {
    pub tenant_id: Uuid,
    pub mode: RemediationMode,
    pub allowed_actions: Vec<String>,
    pub confidence_floor: f64,
}

impl RemediationSettings {
    /// Tenant settings, defaulting to observe-everything when none exist.
    pub async fn load(
        session: &mut TenantSession<'_>,
        tenant_id: Uuid,
    ) -> Result<RemediationSettings> {
        let sql = "SELECT tenant_id, mode, allowed_actions, confidence_floor \
                   FROM remediation_settings WHERE tenant_id = $1";
        let settings = sqlx::query_as::<_, RemediationSettings>(sql)
            .bind(tenant_id)
            .fetch_optional(session.executor(sql)?)
            .await?;

        Ok(settings.unwrap_or(RemediationSettings {
            tenant_id,
            mode: RemediationMode::Observe,
            allowed_actions: Vec::new(),
            confidence_floor: 0.95,
        }))
    }

    fn permits(&self, item: &WasteItem) -> bool {
        self.allowed_actions.iter().any(|a| a == &item.action)
            && item.confidence_score >= self.confidence_floor
    }
}

/// Hourly action cap, atomically checked.
#[async_trait]
pub trait ActionLimiter: Send + Sync {
    /// Returns whether another action of this type may run this hour.
    async fn try_acquire(&self, tenant_id: Uuid, action: &str) -> Result<bool>;
}

/// Per-process fallback limiter.
#[derive(Default)]
pub struct InMemoryActionLimiter {
    counts: Mutex<HashMap<(Uuid, String, i64), u32>>,
}

impl InMemoryActionLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionLimiter for InMemoryActionLimiter {
    async fn try_acquire(&self, tenant_id: Uuid, action: &str) -> Result<bool> {
        let hour = Utc::now().timestamp() / 3600;
        let mut counts = self.counts.lock().await;
        // Drop buckets from previous hours so the map stays small.
        counts.retain(|(_, _, bucket), _| *bucket == hour);

        let counter = counts.entry((tenant_id, action.to_string(), hour)).or_insert(0);
        if *counter >= MAX_ACTIONS_PER_HOUR {
            return Ok(false);
        }
        *counter += 1;
        Ok(true)
    }
}

/// Shared limiter over Redis: INCR + EXPIRE with an hourly key.
pub struct RedisActionLimiter {
    manager: redis::aio::ConnectionManager,
}

impl RedisActionLimiter {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl ActionLimiter for RedisActionLimiter {
    async fn try_acquire(&self, tenant_id: Uuid, action: &str) -> Result<bool> {
        use redis::AsyncCommands;

        let hour = Utc::now().timestamp() / 3600;
        let key = format!("remediation:{tenant_id}:{action}:{hour}");

        let mut conn = self.manager.clone();
        let count: u32 = conn.incr(&key, 1).await?;
        if count == 1 {
            let _: () = conn.expire(&key, 3600).await?;
        }
        Ok(count <= MAX_ACTIONS_PER_HOUR)
    }
}

/// Pick the limiter implementation from configuration.
pub async fn build_action_limiter(redis_url: Option<&str>) -> Arc<dyn ActionLimiter> {
    match redis_url {
        Some(url) => match RedisActionLimiter::connect(url).await {
            Ok(limiter) => Arc::new(limiter),
            Err(e) => {
                warn!(error = %e, "redis_unavailable_falling_back_to_memory_limiter");
                Arc::new(InMemoryActionLimiter::new())
            }
        },
        None => Arc::new(InMemoryActionLimiter::new()),
    }
}

/// Outcome of one remediation sweep.
#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub mode: &'static str,
    pub scanned: usize,
    pub eligible: usize,
    pub auto_executed: usize,
    pub rate_limited: usize,
    pub failed: usize,
}

pub struct RemediationEngine {
    limiter: Arc<dyn ActionLimiter>,
    plugin_timeout: Duration,
}

impl RemediationEngine {
    pub fn new(limiter: Arc<dyn ActionLimiter>, plugin_timeout: Duration) -> Self {
        Self {
            limiter,
            plugin_timeout,
        }
    }

    /// Rescan one connection and act on findings the policy permits.
    pub async fn sweep(
        &self,
        connection: &CloudConnection,
        settings: &RemediationSettings,
        region: Option<&str>,
    ) -> SweepReport {
        let detector = detector_for_connection(connection, region, self.plugin_timeout);
        let scan = detector.scan_all(None).await;
        let items: Vec<WasteItem> = scan.categories.into_values().flatten().collect();

        let mut report = SweepReport {
            mode: match settings.mode {
                RemediationMode::Observe => "observe",
                RemediationMode::Auto => "auto",
            },
            scanned: items.len(),
            ..Default::default()
        };

        let api = build_adapter(connection, region);
        for item in items {
            if !settings.permits(&item) {
                continue;
            }
            report.eligible += 1;

            if settings.mode == RemediationMode::Observe {
                info!(
                    resource_id = %item.resource_id,
                    action = %item.action,
                    "remediation_observed"
                );
                continue;
            }

            match self.limiter.try_acquire(settings.tenant_id, &item.action).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        action = %item.action,
                        "remediation_rate_limited"
                    );
                    report.rate_limited += 1;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "remediation_limiter_unavailable");
                    report.rate_limited += 1;
                    continue;
                }
            }

            match api.execute_action(&item.action, &item.resource_id).await {
                Ok(()) => {
                    info!(
                        resource_id = %item.resource_id,
                        action = %item.action,
                        "remediation_executed"
                    );
                    report.auto_executed += 1;
                }
                Err(e) => {
                    warn!(
                        resource_id = %item.resource_id,
                        action = %item.action,
                        error = %e,
                        "remediation_action_failed"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn limiter_caps_at_fifty_per_hour() {
        let limiter = InMemoryActionLimiter::new();
        let tenant = Uuid::new_v4();

        for _ in 0..MAX_ACTIONS_PER_HOUR {
            assert!(limiter.try_acquire(tenant, "delete_volume").await.unwrap());
        }
        assert!(!limiter.try_acquire(tenant, "delete_volume").await.unwrap());

        // Other action types and tenants have independent budgets.
        assert!(limiter.try_acquire(tenant, "release_ip").await.unwrap());
        assert!(limiter
            .try_acquire(Uuid::new_v4(), "delete_volume")
            .await
            .unwrap());
    }

    #[test]
    fn policy_requires_allowlisted_action_and_confidence() {
        let settings = RemediationSettings {
            tenant_id: Uuid::new_v4(),
            mode: RemediationMode::Auto,
            allowed_actions: vec!["delete_volume".to_string()],
            confidence_floor: 0.95,
        };

        let mut item = WasteItem::new("vol-1", "EBS Volume", dec!(10.00), "delete_volume");
        item.confidence_score = 0.98;
        assert!(settings.permits(&item));

        item.confidence_score = 0.90;
        assert!(!settings.permits(&item));

        let mut other = WasteItem::new("nat-1", "NAT Gateway", dec!(32.40), "delete_nat_gateway");
        other.confidence_score = 0.99;
        assert!(!settings.permits(&other));
    }
}
