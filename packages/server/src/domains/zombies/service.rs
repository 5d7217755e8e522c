//! Multi-cloud zombie-scan orchestrator.
//!
//! Fans detectors out across all of a tenant's connections under one hard
//! deadline, normalizes provider-specific category keys, annotates items with
//! connection metadata (tier-gated where applicable), and optionally hands
//! the aggregate to the async analysis pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::detector::{CheckpointFn, ZombieDetector};
use super::factory::detector_for_connection;
use super::plugin::WasteItem;
use crate::common::metrics;
use crate::db::session::TenantSession;
use crate::domains::connections::{connections_for_tenant, CloudConnection};
use crate::domains::notifications::{NotificationSink, Severity};
use crate::domains::tenancy::{is_feature_enabled, FeatureFlag, PlanTier, Tenant};
use crate::kernel::jobs::{EnqueueSpec, JobStore, JobType};

/// Hard deadline for the whole fan-out.
pub const SCAN_DEADLINE_SECONDS: u64 = 300;
/// Per-plugin deadline default.
pub const PLUGIN_TIMEOUT_SECONDS: u64 = 30;

const UPGRADE_PLACEHOLDER: &str = "Upgrade to Growth";

/// Canonical result categories.
pub const CANONICAL_CATEGORIES: [&str; 12] = [
    "unattached_volumes",
    "old_snapshots",
    "unused_elastic_ips",
    "idle_instances",
    "load_balancer",
    "rds",
    "nat_gateway",
    "idle_s3_buckets",
    "legacy_ecr_images",
    "idle_sagemaker_endpoints",
    "cold_redshift_clusters",
    "orphaned_images",
];

/// Provider-specific keys mapped onto canonical ones.
pub fn canonical_key(key: &str) -> &str {
    match key {
        "unattached_disks" => "unattached_volumes",
        "orphaned_ips" => "unused_elastic_ips",
        other => other,
    }
}

/// Per-connection rollup for the result detail list.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionScanSummary {
    pub connection_id: Uuid,
    pub provider: String,
    pub region: String,
    pub waste: Decimal,
    pub zombies: usize,
}

/// Aggregated scan output.
#[derive(Debug, Default, Serialize)]
pub struct ScanReport {
    pub resources: HashMap<String, Vec<WasteItem>>,
    pub scanned_connections: usize,
    pub total_monthly_waste: Decimal,
    pub scan_timeout: bool,
    pub partial_results: bool,
    pub connection_summaries: Vec<ConnectionScanSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanReport {
    pub fn zombies_found(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Default)]
struct Aggregate {
    resources: HashMap<String, Vec<WasteItem>>,
    total: Decimal,
    summaries: Vec<ConnectionScanSummary>,
}

/// Injectable detector construction (tests swap in stub detectors).
pub type DetectorFactory =
    Arc<dyn Fn(&CloudConnection, Option<&str>, Duration) -> ZombieDetector + Send + Sync>;

pub struct ZombieScanService {
    store: JobStore,
    notifications: Option<Arc<dyn NotificationSink>>,
    plugin_timeout: Duration,
    overall_deadline: Duration,
    detector_factory: DetectorFactory,
}

impl ZombieScanService {
    pub fn new(store: JobStore, notifications: Option<Arc<dyn NotificationSink>>) -> Self {
        Self {
            store,
            notifications,
            plugin_timeout: Duration::from_secs(PLUGIN_TIMEOUT_SECONDS),
            overall_deadline: Duration::from_secs(SCAN_DEADLINE_SECONDS),
            detector_factory: Arc::new(|connection, region, timeout| {
                detector_for_connection(connection, region, timeout)
            }),
        }
    }

    pub fn with_deadlines(mut self, plugin_timeout: Duration, overall_deadline: Duration) -> Self {
        self.plugin_timeout = plugin_timeout;
        self.overall_deadline = overall_deadline;
        self
    }

    pub fn with_detector_factory(mut self, factory: DetectorFactory) -> Self {
        self.detector_factory = factory;
        self
    }

    /// Scan every cloud account of a tenant and aggregate the findings.
    pub async fn scan_for_tenant(
        &self,
        session: &mut TenantSession<'_>,
        tenant_id: Uuid,
        region: Option<&str>,
        analyze: bool,
        on_category_complete: Option<CheckpointFn>,
    ) -> Result<ScanReport> {
        let connections = connections_for_tenant(session, tenant_id).await?;
        if connections.is_empty() {
            let mut report = ScanReport::default();
            report.error = Some("No cloud connections found.".to_string());
            return Ok(report);
        }

        let tier_sql = "SELECT plan FROM tenants WHERE id = $1";
        let tier = Tenant::tier(session.executor(tier_sql)?, tenant_id).await?;

        let mut report = self
            .scan_connections(&connections, tier, region, on_category_complete)
            .await;

        if analyze && !report.scan_timeout {
            report.analysis = Some(self.enqueue_analysis(tenant_id, &report).await);
        }

        // Notifications are best-effort and never mutate the result.
        self.send_notifications(&report).await;

        Ok(report)
    }

    /// Fan detectors out over the given connections under the overall
    /// deadline. Connections finished before a deadline expiry keep their
    /// contribution (partial results).
    pub async fn scan_connections(
        &self,
        connections: &[CloudConnection],
        tier: PlanTier,
        region: Option<&str>,
        on_category_complete: Option<CheckpointFn>,
    ) -> ScanReport {
        let started = Instant::now();
        let has_precision = is_feature_enabled(tier, FeatureFlag::PrecisionDiscovery);
        let has_attribution = is_feature_enabled(tier, FeatureFlag::OwnerAttribution);

        let aggregate = Arc::new(Mutex::new(Aggregate::default()));

        let scans = connections.iter().map(|connection| {
            let aggregate = aggregate.clone();
            let callback = on_category_complete.clone();
            async move {
                let detector =
                    (self.detector_factory)(connection, region, self.plugin_timeout);
                let scan = detector.scan_all(callback).await;

                let mut agg = aggregate.lock().expect("aggregate lock");
                let mut connection_waste = Decimal::ZERO;
                let mut connection_zombies = 0usize;

                for (category, items) in scan.categories {
                    let key = canonical_key(&category);
                    if !CANONICAL_CATEGORIES.contains(&key) {
                        continue;
                    }
                    for mut item in items {
                        annotate(&mut item, connection, has_precision, has_attribution);
                        connection_waste += item.monthly_cost;
                        connection_zombies += 1;
                        agg.resources.entry(key.to_string()).or_default().push(item);
                    }
                }

                agg.total += connection_waste;
                agg.summaries.push(ConnectionScanSummary {
                    connection_id: connection.id(),
                    provider: connection.provider().as_str().to_string(),
                    region: scan.region,
                    waste: connection_waste,
                    zombies: connection_zombies,
                });
            }
        });

        let timed_out = tokio::time::timeout(self.overall_deadline, join_all(scans))
            .await
            .is_err();

        if timed_out {
            error!(deadline_seconds = self.overall_deadline.as_secs(), "scan_overall_timeout");
            metrics::record_scan_timeout("overall");
        } else {
            metrics::record_scan_latency("multi", started.elapsed());
        }

        let aggregate = Arc::try_unwrap(aggregate)
            .map(|m| m.into_inner().expect("aggregate lock"))
            .unwrap_or_else(|arc| {
                // Timed-out scan tasks still hold clones; copy what finished.
                let guard = arc.lock().expect("aggregate lock");
                Aggregate {
                    resources: guard.resources.clone(),
                    total: guard.total,
                    summaries: guard.summaries.clone(),
                }
            });

        ScanReport {
            resources: aggregate.resources,
            scanned_connections: connections.len(),
            total_monthly_waste: aggregate.total.round_dp(2),
            scan_timeout: timed_out,
            partial_results: timed_out,
            connection_summaries: aggregate.summaries,
            analysis: None,
            error: None,
        }
    }

    /// Decoupled LLM follow-up: enqueue one `zombie_analysis` job per tenant
    /// and hour bucket. The dedup key makes repeated scans in the same hour
    /// a no-op.
    async fn enqueue_analysis(&self, tenant_id: Uuid, report: &ScanReport) -> Value {
        let bucket = Utc::now().format("%Y-%m-%d-%H");
        let dedup_key = format!("{tenant_id}:{}:{bucket}", JobType::ZombieAnalysis);

        let spec = EnqueueSpec::new(JobType::ZombieAnalysis)
            .tenant(tenant_id)
            .dedup_key(dedup_key)
            .payload(json!({ "zombies": report.to_value() }));

        match self.store.enqueue(spec).await {
            Ok(outcome) => {
                let status = if outcome.is_created() { "pending" } else { "already_queued" };
                json!({
                    "status": status,
                    "job_id": outcome.job().id.to_string(),
                    "summary": "Analysis has been queued and will be available shortly."
                })
            }
            Err(e) => {
                error!(error = %e, "failed_to_enqueue_analysis");
                json!({ "status": "error", "error": "Failed to queue analysis" })
            }
        }
    }

    async fn send_notifications(&self, report: &ScanReport) {
        let Some(sink) = &self.notifications else { return };
        if report.zombies_found() == 0 {
            return;
        }

        let message = format!(
            "Detected {} zombie resources across {} connections, ~${} / month of waste.",
            report.zombies_found(),
            report.scanned_connections,
            report.total_monthly_waste,
        );
        match sink
            .send_alert("Zombie resources detected", &message, Severity::Warning)
            .await
        {
            Ok(_) => info!("zombie_notification_sent"),
            Err(e) => warn!(error = %e, "zombie_notification_failed"),
        }
    }
}

fn annotate(
    item: &mut WasteItem,
    connection: &CloudConnection,
    has_precision: bool,
    has_attribution: bool,
) {
    item.provider = Some(connection.provider().as_str().to_string());
    item.connection_id = Some(connection.id().to_string());
    item.connection_name = Some(connection.name().to_string());

    let is_gpu = item.is_gpu.as_ref().and_then(Value::as_bool).unwrap_or(false);
    item.is_gpu = Some(if has_precision {
        json!(is_gpu)
    } else {
        json!(UPGRADE_PLACEHOLDER)
    });
    item.owner = Some(if has_attribution {
        item.owner.clone().unwrap_or_else(|| json!("unknown"))
    } else {
        json!(UPGRADE_PLACEHOLDER)
    });
}
