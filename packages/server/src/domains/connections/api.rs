//! Normalized cloud-provider interface.
//!
//! The exact wire shape of provider calls is deliberately kept behind these
//! traits; detection plugins and the cost-ingestion pipeline only ever see
//! normalized resources, metrics and usage records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cloud provider tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inventory categories a provider can enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Volume,
    Snapshot,
    ElasticIp,
    Instance,
    LoadBalancer,
    NatGateway,
    DbInstance,
    StorageBucket,
    ContainerImage,
    MlEndpoint,
    WarehouseCluster,
    Disk,
    PublicIp,
    MachineImage,
}

/// A provider resource in normalized form. Fields a provider cannot supply
/// stay `None`; plugins treat absence conservatively.
#[derive(Debug, Clone, Default)]
pub struct CloudResource {
    pub id: String,
    pub name: Option<String>,
    /// Provider-native lifecycle state (`available`, `Unattached`, ...).
    pub state: Option<String>,
    pub size_gb: Option<f64>,
    pub instance_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub region: Option<String>,
    /// Attachment / association count where the provider reports one.
    pub attachments: Option<i64>,
    pub tags: HashMap<String, String>,
}

impl CloudResource {
    pub fn owner_tag(&self) -> Option<&str> {
        self.tags
            .get("owner")
            .or_else(|| self.tags.get("Owner"))
            .map(|s| s.as_str())
    }
}

/// Time resolution for cost streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hourly,
    Daily,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "HOURLY",
            Granularity::Daily => "DAILY",
        }
    }
}

/// One normalized cost-and-usage record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub occurred_at: DateTime<Utc>,
    pub service: String,
    pub resource_id: Option<String>,
    pub region: Option<String>,
    pub cost_usd: Decimal,
    pub usage_amount: Option<Decimal>,
    pub usage_unit: Option<String>,
}

/// Read/act surface used by zombie plugins and the remediation engine.
///
/// Implementations must translate provider failures into errors; the caller
/// (plugin or engine) decides whether a failure is fatal.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    fn provider(&self) -> Provider;

    /// Enumerate resources of one kind in the connection's scope.
    async fn list_resources(&self, kind: ResourceKind) -> anyhow::Result<Vec<CloudResource>>;

    /// Sum of a metric over a trailing window, in the metric's native unit.
    async fn metric_sum(
        &self,
        resource_id: &str,
        metric: &str,
        lookback_days: u32,
    ) -> anyhow::Result<f64>;

    /// Execute a remediation action (`delete_volume`, `release_ip`, ...).
    async fn execute_action(&self, action: &str, resource_id: &str) -> anyhow::Result<()>;
}

/// Full adapter surface: inventory plus cost streaming.
#[async_trait]
pub trait CloudAdapter: ProviderApi {
    /// Lazy sequence of normalized cost records for the window.
    async fn stream_cost_and_usage(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<UsageRecord>>>;
}
