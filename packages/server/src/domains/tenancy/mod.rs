//! Tenants, plan tiers and feature gating.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

/// Subscription tier of a tenant. Ordering matters: gating compares tiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "plan_tier", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Trial,
    Starter,
    Growth,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Trial => "trial",
            PlanTier::Starter => "starter",
            PlanTier::Growth => "growth",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

/// Tier-gated product capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureFlag {
    ZombieScan,
    CostTracking,
    /// GPU detection on waste items.
    PrecisionDiscovery,
    /// Owner attribution on waste items.
    OwnerAttribution,
    /// LLM-backed analysis of scan results.
    LlmAnalysis,
}

/// Lowest tier at which a feature unlocks.
pub fn is_feature_enabled(tier: PlanTier, flag: FeatureFlag) -> bool {
    let floor = match flag {
        FeatureFlag::ZombieScan | FeatureFlag::CostTracking => PlanTier::Trial,
        FeatureFlag::PrecisionDiscovery
        | FeatureFlag::OwnerAttribution
        | FeatureFlag::LlmAnalysis => PlanTier::Growth,
    };
    tier >= floor
}

/// An isolated customer organization; the unit of multi-tenancy.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub plan: PlanTier,
}

impl Tenant {
    /// Tier lookup used by gating decisions. Tenant rows are identity data
    /// and readable without RLS context.
    pub async fn tier(conn: &mut PgConnection, tenant_id: Uuid) -> anyhow::Result<PlanTier> {
        let tier = sqlx::query_scalar::<_, PlanTier>("SELECT plan FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(conn)
            .await?
            .unwrap_or(PlanTier::Trial);
        Ok(tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering_matches_plans() {
        assert!(PlanTier::Trial < PlanTier::Starter);
        assert!(PlanTier::Starter < PlanTier::Growth);
        assert!(PlanTier::Growth < PlanTier::Pro);
        assert!(PlanTier::Pro < PlanTier::Enterprise);
    }

    #[test]
    fn precision_features_unlock_at_growth() {
        assert!(!is_feature_enabled(PlanTier::Starter, FeatureFlag::PrecisionDiscovery));
        assert!(is_feature_enabled(PlanTier::Growth, FeatureFlag::PrecisionDiscovery));
        assert!(is_feature_enabled(PlanTier::Enterprise, FeatureFlag::OwnerAttribution));
        assert!(!is_feature_enabled(PlanTier::Trial, FeatureFlag::LlmAnalysis));
    }

    #[test]
    fn base_features_available_everywhere() {
        assert!(is_feature_enabled(PlanTier::Trial, FeatureFlag::ZombieScan));
        assert!(is_feature_enabled(PlanTier::Trial, FeatureFlag::CostTracking));
    }
}
