//! Per-connection scan fan-out.
//!
//! A detector owns one provider client and the plugin set for that provider.
//! `scan_all` runs the plugins concurrently: each plugin has its own timeout
//! (a timed-out plugin contributes an empty list, the scan itself never
//! fails), and the checkpoint callback fires as each category completes,
//! before aggregation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use super::plugin::{ScanContext, WasteItem, ZombiePlugin};
use crate::common::metrics;
use crate::domains::connections::{CloudAdapter, Provider};

/// Concurrent plugin executions per scan.
const SCAN_PARALLELISM: usize = 10;

/// Callback invoked after each plugin completes, before aggregation.
/// Failures are logged and do not propagate.
pub type CheckpointFn =
    Arc<dyn Fn(String, Vec<WasteItem>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Aggregated result of one detector run.
#[derive(Debug, Clone)]
pub struct DetectorScan {
    pub provider: Provider,
    pub region: String,
    pub scanned_at: DateTime<Utc>,
    pub categories: HashMap<String, Vec<WasteItem>>,
    pub total_monthly_waste: Decimal,
}

pub struct ZombieDetector {
    provider: Provider,
    region: String,
    api: Arc<dyn CloudAdapter>,
    plugins: Vec<Arc<dyn ZombiePlugin>>,
    plugin_timeout: Duration,
}

impl ZombieDetector {
    pub fn new(
        provider: Provider,
        region: impl Into<String>,
        api: Arc<dyn CloudAdapter>,
        plugins: Vec<Arc<dyn ZombiePlugin>>,
        plugin_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            region: region.into(),
            api,
            plugins,
            plugin_timeout,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Run every plugin in parallel and aggregate.
    pub async fn scan_all(&self, on_category_complete: Option<CheckpointFn>) -> DetectorScan {
        let semaphore = Arc::new(Semaphore::new(SCAN_PARALLELISM));
        let context = ScanContext {
            api: self.api.clone(),
            region: self.region.clone(),
            plugin_timeout: self.plugin_timeout,
        };

        let tasks = self.plugins.iter().map(|plugin| {
            let plugin = plugin.clone();
            let semaphore = semaphore.clone();
            let callback = on_category_complete.clone();
            let context = &context;

            async move {
                let _permit = semaphore.acquire().await;

                let items =
                    match tokio::time::timeout(context.plugin_timeout, plugin.scan(context)).await
                    {
                        Ok(items) => items,
                        Err(_) => {
                            error!(plugin = plugin.category_key(), "plugin_timeout");
                            metrics::record_scan_timeout("plugin");
                            Vec::new()
                        }
                    };

                if let Some(callback) = &callback {
                    if let Err(e) =
                        callback(plugin.category_key().to_string(), items.clone()).await
                    {
                        warn!(
                            plugin = plugin.category_key(),
                            error = %e,
                            "checkpoint_callback_failed"
                        );
                    }
                }

                (plugin.category_key().to_string(), items)
            }
        });

        let results = join_all(tasks).await;

        let mut categories: HashMap<String, Vec<WasteItem>> = self
            .plugins
            .iter()
            .map(|p| (p.category_key().to_string(), Vec::new()))
            .collect();
        let mut total = Decimal::ZERO;
        for (category, items) in results {
            for item in &items {
                total += item.monthly_cost;
            }
            categories.insert(category, items);
        }

        tracing::info!(
            provider = %self.provider,
            region = %self.region,
            waste = %total,
            plugins_run = self.plugins.len(),
            "zombie_scan_complete"
        );

        DetectorScan {
            provider: self.provider,
            region: self.region.clone(),
            scanned_at: Utc::now(),
            categories,
            total_monthly_waste: total.round_dp(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::zombies::testing::{FailingApi, SleepyPlugin, StaticPlugin};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detector(plugins: Vec<Arc<dyn ZombiePlugin>>, timeout: Duration) -> ZombieDetector {
        ZombieDetector::new(
            Provider::Aws,
            "us-east-1",
            Arc::new(FailingApi),
            plugins,
            timeout,
        )
    }

    #[tokio::test]
    async fn aggregates_items_across_plugins() {
        let plugins: Vec<Arc<dyn ZombiePlugin>> = vec![
            Arc::new(StaticPlugin::new("unattached_volumes", dec!(12.50), 2)),
            Arc::new(StaticPlugin::new("old_snapshots", dec!(5.00), 1)),
        ];
        let scan = detector(plugins, Duration::from_secs(5)).scan_all(None).await;

        assert_eq!(scan.categories["unattached_volumes"].len(), 2);
        assert_eq!(scan.categories["old_snapshots"].len(), 1);
        assert_eq!(scan.total_monthly_waste, dec!(30.00));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_plugin_contributes_empty_list() {
        let plugins: Vec<Arc<dyn ZombiePlugin>> = vec![
            Arc::new(SleepyPlugin::new("unattached_volumes", Duration::from_secs(600))),
            Arc::new(StaticPlugin::new("old_snapshots", dec!(7.00), 1)),
        ];
        let scan = detector(plugins, Duration::from_secs(30)).scan_all(None).await;

        assert!(scan.categories["unattached_volumes"].is_empty());
        assert_eq!(scan.categories["old_snapshots"].len(), 1);
        assert_eq!(scan.total_monthly_waste, dec!(7.00));
    }

    #[tokio::test]
    async fn checkpoint_fires_per_category_and_failures_are_absorbed() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let callback: CheckpointFn = Arc::new(|category, _items| {
            Box::pin(async move {
                CALLS.fetch_add(1, Ordering::SeqCst);
                if category == "old_snapshots" {
                    anyhow::bail!("checkpoint store unavailable");
                }
                Ok(())
            })
        });

        let plugins: Vec<Arc<dyn ZombiePlugin>> = vec![
            Arc::new(StaticPlugin::new("unattached_volumes", dec!(1.00), 1)),
            Arc::new(StaticPlugin::new("old_snapshots", dec!(2.00), 1)),
        ];
        let scan = detector(plugins, Duration::from_secs(5))
            .scan_all(Some(callback))
            .await;

        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        // The failing checkpoint did not disturb aggregation.
        assert_eq!(scan.total_monthly_waste, dec!(3.00));
    }

    struct PanickyFreePlugin;

    #[async_trait]
    impl ZombiePlugin for PanickyFreePlugin {
        fn category_key(&self) -> &'static str {
            "idle_instances"
        }

        async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
            // Exercises the contract: API errors surface as empty results.
            match ctx.api.list_resources(crate::domains::connections::ResourceKind::Instance).await {
                Ok(_) => vec![],
                Err(_) => vec![],
            }
        }
    }

    #[tokio::test]
    async fn api_failures_do_not_fail_the_detector() {
        let plugins: Vec<Arc<dyn ZombiePlugin>> = vec![Arc::new(PanickyFreePlugin)];
        let scan = detector(plugins, Duration::from_secs(5)).scan_all(None).await;
        assert!(scan.categories["idle_instances"].is_empty());
        assert_eq!(scan.total_monthly_waste, Decimal::ZERO);
    }
}
