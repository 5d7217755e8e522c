//! Test doubles for the zombie-scan machinery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use rust_decimal::Decimal;

use super::plugin::{ScanContext, WasteItem, ZombiePlugin};
use crate::domains::connections::{
    CloudAdapter, CloudResource, Granularity, Provider, ProviderApi, ResourceKind, UsageRecord,
};

/// Configurable in-memory provider API.
#[derive(Default, Clone)]
pub struct StubApi {
    resources: HashMap<ResourceKind, Vec<CloudResource>>,
    metric: f64,
    failing: bool,
}

impl StubApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resources(mut self, kind: ResourceKind, resources: Vec<CloudResource>) -> Self {
        self.resources.insert(kind, resources);
        self
    }

    pub fn with_metric(mut self, metric: f64) -> Self {
        self.metric = metric;
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }
}

#[async_trait]
impl ProviderApi for StubApi {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    async fn list_resources(&self, kind: ResourceKind) -> Result<Vec<CloudResource>> {
        if self.failing {
            return Err(anyhow!("provider unavailable"));
        }
        Ok(self.resources.get(&kind).cloned().unwrap_or_default())
    }

    async fn metric_sum(&self, _resource_id: &str, _metric: &str, _days: u32) -> Result<f64> {
        if self.failing {
            return Err(anyhow!("provider unavailable"));
        }
        Ok(self.metric)
    }

    async fn execute_action(&self, _action: &str, _resource_id: &str) -> Result<()> {
        if self.failing {
            return Err(anyhow!("provider unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudAdapter for StubApi {
    async fn stream_cost_and_usage(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _granularity: Granularity,
    ) -> Result<BoxStream<'static, Result<UsageRecord>>> {
        Ok(stream::empty().boxed())
    }
}

/// API whose every call errors.
pub struct FailingApi;

#[async_trait]
impl ProviderApi for FailingApi {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    async fn list_resources(&self, _kind: ResourceKind) -> Result<Vec<CloudResource>> {
        Err(anyhow!("provider unavailable"))
    }

    async fn metric_sum(&self, _resource_id: &str, _metric: &str, _days: u32) -> Result<f64> {
        Err(anyhow!("provider unavailable"))
    }

    async fn execute_action(&self, _action: &str, _resource_id: &str) -> Result<()> {
        Err(anyhow!("provider unavailable"))
    }
}

#[async_trait]
impl CloudAdapter for FailingApi {
    async fn stream_cost_and_usage(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _granularity: Granularity,
    ) -> Result<BoxStream<'static, Result<UsageRecord>>> {
        Ok(stream::empty().boxed())
    }
}

/// Plugin returning a fixed number of identical items.
pub struct StaticPlugin {
    key: &'static str,
    cost: Decimal,
    count: usize,
}

impl StaticPlugin {
    pub fn new(key: &'static str, cost: Decimal, count: usize) -> Self {
        Self { key, cost, count }
    }
}

#[async_trait]
impl ZombiePlugin for StaticPlugin {
    fn category_key(&self) -> &'static str {
        self.key
    }

    async fn scan(&self, _ctx: &ScanContext) -> Vec<WasteItem> {
        (0..self.count)
            .map(|i| WasteItem::new(format!("{}-{i}", self.key), "Test Resource", self.cost, "noop"))
            .collect()
    }
}

/// Plugin that sleeps past any reasonable timeout.
pub struct SleepyPlugin {
    key: &'static str,
    sleep: Duration,
}

impl SleepyPlugin {
    pub fn new(key: &'static str, sleep: Duration) -> Self {
        Self { key, sleep }
    }
}

#[async_trait]
impl ZombiePlugin for SleepyPlugin {
    fn category_key(&self) -> &'static str {
        self.key
    }

    async fn scan(&self, _ctx: &ScanContext) -> Vec<WasteItem> {
        tokio::time::sleep(self.sleep).await;
        Vec::new()
    }
}

/// Build a static-plugin detector factory for service tests.
pub fn static_detector_factory(
    cost: Decimal,
    items_per_connection: usize,
) -> super::service::DetectorFactory {
    Arc::new(move |connection, region, plugin_timeout| {
        let plugins: Vec<Arc<dyn ZombiePlugin>> = vec![Arc::new(StaticPlugin::new(
            "unattached_volumes",
            cost,
            items_per_connection,
        ))];
        super::detector::ZombieDetector::new(
            connection.provider(),
            connection.scan_region(region),
            Arc::new(StubApi::new()),
            plugins,
            plugin_timeout,
        )
    })
}

/// Detector factory whose single plugin hangs for `sleep`.
pub fn sleepy_detector_factory(sleep: Duration) -> super::service::DetectorFactory {
    Arc::new(move |connection, region, plugin_timeout| {
        let plugins: Vec<Arc<dyn ZombiePlugin>> =
            vec![Arc::new(SleepyPlugin::new("unattached_volumes", sleep))];
        super::detector::ZombieDetector::new(
            connection.provider(),
            connection.scan_region(region),
            Arc::new(StubApi::new()),
            plugins,
            plugin_timeout,
        )
    })
}
