//! Zombie-detection plugin contract.
//!
//! One plugin per resource category. Plugins receive a scan context with the
//! provider client and return normalized waste items; provider API failures
//! are logged and yield an empty list, never an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domains::connections::CloudAdapter;

/// Estimated monthly costs (USD) used for waste impact analysis.
pub mod estimated_costs {
    use super::*;

    pub const EBS_VOLUME_GB: Decimal = dec!(0.10);
    pub const ELASTIC_IP: Decimal = dec!(3.60);
    pub const SNAPSHOT_GB: Decimal = dec!(0.05);
    pub const EC2_DEFAULT: Decimal = dec!(10.00);
    pub const EC2_M5_LARGE: Decimal = dec!(69.12);
    pub const ELB: Decimal = dec!(20.00);
    pub const S3_GB: Decimal = dec!(0.023);
    pub const ECR_GB: Decimal = dec!(0.10);
    pub const SAGEMAKER_ENDPOINT: Decimal = dec!(108.00);
    pub const REDSHIFT_CLUSTER: Decimal = dec!(180.00);
    pub const NAT_GATEWAY: Decimal = dec!(32.40);
    pub const RDS_INSTANCE: Decimal = dec!(55.00);
    pub const MANAGED_DISK_GB: Decimal = dec!(0.09);
    pub const MACHINE_IMAGE_GB: Decimal = dec!(0.05);

    /// Rough instance pricing by type prefix.
    pub fn instance_monthly(instance_type: Option<&str>) -> Decimal {
        match instance_type {
            Some(t) if t.starts_with("t3.micro") => dec!(7.50),
            Some(t) if t.starts_with("t3.small") => dec!(15.00),
            Some(t) if t.starts_with("t3.medium") => dec!(30.00),
            Some(t) if t.starts_with("m5.large") => EC2_M5_LARGE,
            Some(t) if t.starts_with("p") || t.starts_with("g") => dec!(540.00),
            _ => EC2_DEFAULT,
        }
    }
}

/// A detected zombie resource in the shape downstream remediation expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WasteItem {
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_days: Option<i64>,
    pub monthly_cost: Decimal,
    pub backup_cost_monthly: Decimal,
    pub recommendation: String,
    pub action: String,
    pub supports_backup: bool,
    pub explainability_notes: String,
    pub confidence_score: f64,

    // Annotations added by the orchestrator; `is_gpu` and `owner` are tier
    // gated and may carry an upgrade placeholder instead of data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_gpu: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<Value>,
}

impl WasteItem {
    /// Base constructor; annotation fields start empty.
    pub fn new(
        resource_id: impl Into<String>,
        resource_type: impl Into<String>,
        monthly_cost: Decimal,
        action: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_name: None,
            resource_type: resource_type.into(),
            size_gb: None,
            age_days: None,
            monthly_cost,
            backup_cost_monthly: Decimal::ZERO,
            recommendation: String::new(),
            action: action.into(),
            supports_backup: false,
            explainability_notes: String::new(),
            confidence_score: 0.9,
            provider: None,
            connection_id: None,
            connection_name: None,
            is_gpu: None,
            owner: None,
        }
    }
}

/// Everything a plugin needs to talk to the provider.
pub struct ScanContext {
    pub api: Arc<dyn CloudAdapter>,
    pub region: String,
    pub plugin_timeout: Duration,
}

/// Detection strategy for one resource category.
#[async_trait]
pub trait ZombiePlugin: Send + Sync {
    /// Result key, unique per provider (e.g. `unattached_volumes`).
    fn category_key(&self) -> &'static str;

    /// Scan for zombie resources. Provider failures must be absorbed: log a
    /// warning and return what was found so far (or nothing).
    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_pricing_prefers_specific_types() {
        assert_eq!(estimated_costs::instance_monthly(Some("t3.micro")), dec!(7.50));
        assert_eq!(estimated_costs::instance_monthly(Some("m5.large")), dec!(69.12));
        assert_eq!(estimated_costs::instance_monthly(Some("x2.oddball")), dec!(10.00));
        assert_eq!(estimated_costs::instance_monthly(None), dec!(10.00));
    }

    #[test]
    fn waste_item_starts_unannotated() {
        let item = WasteItem::new("vol-1", "EBS Volume", dec!(20.00), "delete_volume");
        assert!(item.provider.is_none());
        assert!(item.owner.is_none());
        assert_eq!(item.backup_cost_monthly, Decimal::ZERO);
    }
}
