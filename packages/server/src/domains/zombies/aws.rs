//! AWS detection plugins.
//!
//! Categories here use the canonical result keys directly; Azure/GCP plugins
//! use provider-specific keys that the orchestrator normalizes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use super::plugin::{estimated_costs, ScanContext, WasteItem, ZombiePlugin};
use crate::domains::connections::{CloudResource, ResourceKind};

/// Full AWS plugin set, one per resource category.
pub fn plugins() -> Vec<Arc<dyn ZombiePlugin>> {
    vec![
        Arc::new(UnattachedVolumesPlugin),
        Arc::new(OldSnapshotsPlugin),
        Arc::new(UnusedElasticIpsPlugin),
        Arc::new(IdleInstancesPlugin),
        Arc::new(OrphanLoadBalancersPlugin),
        Arc::new(UnderusedNatGatewaysPlugin),
        Arc::new(IdleRdsPlugin),
        Arc::new(IdleS3BucketsPlugin),
        Arc::new(LegacyEcrImagesPlugin),
        Arc::new(IdleSagemakerEndpointsPlugin),
        Arc::new(ColdRedshiftClustersPlugin),
    ]
}

/// Shared listing helper: API failures become a logged warning and an empty
/// inventory, per the plugin contract.
async fn list_or_empty(ctx: &ScanContext, kind: ResourceKind, plugin: &str) -> Vec<CloudResource> {
    match ctx.api.list_resources(kind).await {
        Ok(resources) => resources,
        Err(e) => {
            warn!(plugin, error = %e, "plugin_inventory_failed");
            Vec::new()
        }
    }
}

fn size_cost(size_gb: Option<f64>, per_gb: Decimal) -> Decimal {
    let gb = Decimal::from_f64(size_gb.unwrap_or(0.0)).unwrap_or_default();
    (gb * per_gb).round_dp(2)
}

fn age_days(resource: &CloudResource) -> Option<i64> {
    resource.created_at.map(|c| (Utc::now() - c).num_days())
}

pub struct UnattachedVolumesPlugin;

#[async_trait]
impl ZombiePlugin for UnattachedVolumesPlugin {
    fn category_key(&self) -> &'static str {
        "unattached_volumes"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        let mut zombies = Vec::new();
        for volume in list_or_empty(ctx, ResourceKind::Volume, self.category_key()).await {
            if volume.state.as_deref() != Some("available") {
                continue;
            }

            // A detached volume with recent I/O is probably mid-migration.
            let ops = match ctx
                .api
                .metric_sum(&volume.id, "AWS/EBS:VolumeReadOps:VolumeId", 7)
                .await
            {
                Ok(read_ops) => {
                    let write_ops = ctx
                        .api
                        .metric_sum(&volume.id, "AWS/EBS:VolumeWriteOps:VolumeId", 7)
                        .await
                        .unwrap_or(0.0);
                    Some(read_ops + write_ops)
                }
                Err(e) => {
                    warn!(volume = %volume.id, error = %e, "volume_metric_check_failed");
                    None
                }
            };
            if matches!(ops, Some(total) if total > 0.0) {
                continue;
            }

            let mut item = WasteItem::new(
                &volume.id,
                "EBS Volume",
                size_cost(volume.size_gb, estimated_costs::EBS_VOLUME_GB),
                "delete_volume",
            );
            item.resource_name = volume.name.clone();
            item.size_gb = volume.size_gb;
            item.backup_cost_monthly = size_cost(volume.size_gb, estimated_costs::SNAPSHOT_GB);
            item.recommendation = "Delete if no longer needed".into();
            item.supports_backup = true;
            item.explainability_notes =
                "Volume is 'available' (detached) and has had 0 IOPS in the last 7 days.".into();
            item.confidence_score = if ops == Some(0.0) { 0.98 } else { 0.85 };
            item.owner = volume.owner_tag().map(|o| o.into());
            zombies.push(item);
        }
        zombies
    }
}

pub struct OldSnapshotsPlugin;

#[async_trait]
impl ZombiePlugin for OldSnapshotsPlugin {
    fn category_key(&self) -> &'static str {
        "old_snapshots"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        const RETENTION_DAYS: i64 = 90;

        let mut zombies = Vec::new();
        for snapshot in list_or_empty(ctx, ResourceKind::Snapshot, self.category_key()).await {
            let Some(age) = age_days(&snapshot) else { continue };
            if age < RETENTION_DAYS {
                continue;
            }

            let mut item = WasteItem::new(
                &snapshot.id,
                "EBS Snapshot",
                size_cost(snapshot.size_gb, estimated_costs::SNAPSHOT_GB),
                "delete_snapshot",
            );
            item.size_gb = snapshot.size_gb;
            item.age_days = Some(age);
            item.recommendation = "Delete if backup no longer needed".into();
            item.explainability_notes = format!(
                "Snapshot is {age} days old, exceeding standard data retention policies."
            );
            item.confidence_score = 0.99;
            item.owner = snapshot.owner_tag().map(|o| o.into());
            zombies.push(item);
        }
        zombies
    }
}

pub struct UnusedElasticIpsPlugin;

#[async_trait]
impl ZombiePlugin for UnusedElasticIpsPlugin {
    fn category_key(&self) -> &'static str {
        "unused_elastic_ips"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        let mut zombies = Vec::new();
        for address in list_or_empty(ctx, ResourceKind::ElasticIp, self.category_key()).await {
            if address.attachments.unwrap_or(0) > 0 {
                continue;
            }

            let mut item = WasteItem::new(
                &address.id,
                "Elastic IP",
                estimated_costs::ELASTIC_IP,
                "release_ip",
            );
            item.resource_name = address.name.clone();
            item.recommendation = "Release the address".into();
            item.explainability_notes =
                "Elastic IP is allocated but not associated with any instance or interface.".into();
            item.confidence_score = 0.97;
            item.owner = address.owner_tag().map(|o| o.into());
            zombies.push(item);
        }
        zombies
    }
}

pub struct IdleInstancesPlugin;

#[async_trait]
impl ZombiePlugin for IdleInstancesPlugin {
    fn category_key(&self) -> &'static str {
        "idle_instances"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        const IDLE_CPU_PERCENT_SUM: f64 = 35.0; // ~5%/day over 7 days

        let mut zombies = Vec::new();
        for instance in list_or_empty(ctx, ResourceKind::Instance, self.category_key()).await {
            if instance.state.as_deref() != Some("running") {
                continue;
            }

            let cpu = match ctx
                .api
                .metric_sum(&instance.id, "AWS/EC2:CPUUtilization:InstanceId", 7)
                .await
            {
                Ok(cpu) => cpu,
                Err(e) => {
                    warn!(instance = %instance.id, error = %e, "instance_metric_check_failed");
                    continue;
                }
            };
            if cpu > IDLE_CPU_PERCENT_SUM {
                continue;
            }

            let instance_type = instance.instance_type.as_deref();
            let is_gpu = instance_type
                .map(|t| t.starts_with('p') || t.starts_with('g'))
                .unwrap_or(false);

            let mut item = WasteItem::new(
                &instance.id,
                "EC2 Instance",
                estimated_costs::instance_monthly(instance_type),
                "stop_instance",
            );
            item.resource_name = instance.name.clone();
            item.recommendation = "Stop or rightsize the instance".into();
            item.explainability_notes = format!(
                "Instance CPU has summed to {cpu:.1}% over 7 days; it is effectively idle."
            );
            item.confidence_score = 0.82;
            item.is_gpu = Some(is_gpu.into());
            item.owner = instance.owner_tag().map(|o| o.into());
            zombies.push(item);
        }
        zombies
    }
}

pub struct OrphanLoadBalancersPlugin;

#[async_trait]
impl ZombiePlugin for OrphanLoadBalancersPlugin {
    fn category_key(&self) -> &'static str {
        "load_balancer"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        let mut zombies = Vec::new();
        for lb in list_or_empty(ctx, ResourceKind::LoadBalancer, self.category_key()).await {
            let requests = ctx
                .api
                .metric_sum(&lb.id, "AWS/ApplicationELB:RequestCount:LoadBalancer", 7)
                .await
                .unwrap_or(0.0);
            if requests > 0.0 {
                continue;
            }

            let mut item =
                WasteItem::new(&lb.id, "Load Balancer", estimated_costs::ELB, "delete_load_balancer");
            item.resource_name = lb.name.clone();
            item.recommendation = "Delete if no longer needed".into();
            item.explainability_notes =
                "Load balancer served no requests in the last 7 days; no healthy traffic.".into();
            item.confidence_score = 0.95;
            zombies.push(item);
        }
        zombies
    }
}

pub struct UnderusedNatGatewaysPlugin;

#[async_trait]
impl ZombiePlugin for UnderusedNatGatewaysPlugin {
    fn category_key(&self) -> &'static str {
        "nat_gateway"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        const MIN_MONTHLY_BYTES: f64 = 1_000_000_000.0; // 1 GB

        let mut zombies = Vec::new();
        for nat in list_or_empty(ctx, ResourceKind::NatGateway, self.category_key()).await {
            if nat.state.as_deref() != Some("available") {
                continue;
            }

            let bytes = ctx
                .api
                .metric_sum(&nat.id, "AWS/NATGateway:BytesOutToDestination:NatGatewayId", 7)
                .await
                .unwrap_or(0.0);
            if bytes > MIN_MONTHLY_BYTES {
                continue;
            }

            let mut item = WasteItem::new(
                &nat.id,
                "NAT Gateway",
                estimated_costs::NAT_GATEWAY,
                "delete_nat_gateway",
            );
            item.recommendation = "Delete and route through a shared gateway".into();
            item.explainability_notes = format!(
                "NAT gateway moved {:.0} bytes in 7 days, below the 1 GB usefulness floor.",
                bytes
            );
            item.confidence_score = 0.88;
            zombies.push(item);
        }
        zombies
    }
}

pub struct IdleRdsPlugin;

#[async_trait]
impl ZombiePlugin for IdleRdsPlugin {
    fn category_key(&self) -> &'static str {
        "rds"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        let mut zombies = Vec::new();
        for db in list_or_empty(ctx, ResourceKind::DbInstance, self.category_key()).await {
            if db.state.as_deref() != Some("available") {
                continue;
            }

            let connections = ctx
                .api
                .metric_sum(&db.id, "AWS/RDS:DatabaseConnections:DBInstanceIdentifier", 7)
                .await
                .unwrap_or(0.0);
            if connections > 0.0 {
                continue;
            }

            let mut item = WasteItem::new(
                &db.id,
                "RDS Instance",
                estimated_costs::RDS_INSTANCE,
                "stop_instance",
            );
            item.resource_name = db.name.clone();
            item.size_gb = db.size_gb;
            item.recommendation = "Stop the instance or snapshot and delete".into();
            item.supports_backup = true;
            item.explainability_notes =
                "Database accepted zero connections over the last 7 days.".into();
            item.confidence_score = 0.9;
            zombies.push(item);
        }
        zombies
    }
}

pub struct IdleS3BucketsPlugin;

#[async_trait]
impl ZombiePlugin for IdleS3BucketsPlugin {
    fn category_key(&self) -> &'static str {
        "idle_s3_buckets"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        let mut zombies = Vec::new();
        for bucket in list_or_empty(ctx, ResourceKind::StorageBucket, self.category_key()).await {
            let requests = ctx
                .api
                .metric_sum(&bucket.id, "AWS/S3:AllRequests:BucketName", 30)
                .await
                .unwrap_or(0.0);
            if requests > 0.0 {
                continue;
            }

            let mut item = WasteItem::new(
                &bucket.id,
                "S3 Bucket",
                size_cost(bucket.size_gb, estimated_costs::S3_GB),
                "archive_bucket",
            );
            item.resource_name = bucket.name.clone();
            item.size_gb = bucket.size_gb;
            item.recommendation = "Move to Glacier or delete".into();
            item.supports_backup = true;
            item.explainability_notes =
                "Bucket received no requests in the last 30 days.".into();
            item.confidence_score = 0.8;
            zombies.push(item);
        }
        zombies
    }
}

pub struct LegacyEcrImagesPlugin;

#[async_trait]
impl ZombiePlugin for LegacyEcrImagesPlugin {
    fn category_key(&self) -> &'static str {
        "legacy_ecr_images"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        const STALE_DAYS: i64 = 180;

        let mut zombies = Vec::new();
        for repo in list_or_empty(ctx, ResourceKind::ContainerImage, self.category_key()).await {
            let Some(age) = age_days(&repo) else { continue };
            if age < STALE_DAYS {
                continue;
            }

            let mut item = WasteItem::new(
                &repo.id,
                "ECR Repository",
                size_cost(repo.size_gb, estimated_costs::ECR_GB),
                "delete_images",
            );
            item.resource_name = repo.name.clone();
            item.age_days = Some(age);
            item.recommendation = "Add a lifecycle policy and prune old images".into();
            item.explainability_notes =
                format!("Repository has had no pushes for {age} days.");
            item.confidence_score = 0.75;
            zombies.push(item);
        }
        zombies
    }
}

pub struct IdleSagemakerEndpointsPlugin;

#[async_trait]
impl ZombiePlugin for IdleSagemakerEndpointsPlugin {
    fn category_key(&self) -> &'static str {
        "idle_sagemaker_endpoints"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        let mut zombies = Vec::new();
        for endpoint in list_or_empty(ctx, ResourceKind::MlEndpoint, self.category_key()).await {
            let invocations = ctx
                .api
                .metric_sum(&endpoint.id, "AWS/SageMaker:Invocations:EndpointName", 7)
                .await
                .unwrap_or(0.0);
            if invocations > 0.0 {
                continue;
            }

            let mut item = WasteItem::new(
                &endpoint.id,
                "SageMaker Endpoint",
                estimated_costs::SAGEMAKER_ENDPOINT,
                "delete_endpoint",
            );
            item.resource_name = endpoint.name.clone();
            item.recommendation = "Delete and redeploy on demand".into();
            item.explainability_notes =
                "Endpoint served zero invocations in the last 7 days while billing hourly.".into();
            item.confidence_score = 0.93;
            item.is_gpu = Some(true.into());
            zombies.push(item);
        }
        zombies
    }
}

pub struct ColdRedshiftClustersPlugin;

#[async_trait]
impl ZombiePlugin for ColdRedshiftClustersPlugin {
    fn category_key(&self) -> &'static str {
        "cold_redshift_clusters"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        let mut zombies = Vec::new();
        for cluster in list_or_empty(ctx, ResourceKind::WarehouseCluster, self.category_key()).await
        {
            if cluster.state.as_deref() != Some("available") {
                continue;
            }

            let connections = ctx
                .api
                .metric_sum(&cluster.id, "AWS/Redshift:DatabaseConnections:ClusterIdentifier", 7)
                .await
                .unwrap_or(0.0);
            if connections > 0.0 {
                continue;
            }

            let mut item = WasteItem::new(
                &cluster.id,
                "Redshift Cluster",
                estimated_costs::REDSHIFT_CLUSTER,
                "pause_cluster",
            );
            item.resource_name = cluster.name.clone();
            item.recommendation = "Pause the cluster".into();
            item.supports_backup = true;
            item.explainability_notes =
                "Warehouse had zero connections over the last 7 days.".into();
            item.confidence_score = 0.9;
            zombies.push(item);
        }
        zombies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::zombies::testing::StubApi;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn context(api: StubApi) -> ScanContext {
        ScanContext {
            api: Arc::new(api),
            region: "us-east-1".into(),
            plugin_timeout: Duration::from_secs(30),
        }
    }

    fn volume(id: &str, state: &str, size_gb: f64) -> CloudResource {
        CloudResource {
            id: id.into(),
            state: Some(state.into()),
            size_gb: Some(size_gb),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn detached_quiet_volume_is_a_zombie() {
        let api = StubApi::new()
            .with_resources(ResourceKind::Volume, vec![volume("vol-1", "available", 100.0)])
            .with_metric(0.0);
        let items = UnattachedVolumesPlugin.scan(&context(api)).await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].monthly_cost, dec!(10.00));
        assert_eq!(items[0].action, "delete_volume");
        assert!(items[0].supports_backup);
        assert!((items[0].confidence_score - 0.98).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn attached_or_busy_volumes_are_skipped() {
        let api = StubApi::new()
            .with_resources(
                ResourceKind::Volume,
                vec![volume("vol-1", "in-use", 100.0), volume("vol-2", "available", 50.0)],
            )
            .with_metric(500.0);
        let items = UnattachedVolumesPlugin.scan(&context(api)).await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn api_failure_yields_empty_not_error() {
        let api = StubApi::new().failing();
        let items = UnusedElasticIpsPlugin.scan(&context(api)).await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn old_snapshot_cutoff_is_ninety_days() {
        let recent = CloudResource {
            id: "snap-new".into(),
            size_gb: Some(10.0),
            created_at: Some(Utc::now() - chrono::Duration::days(30)),
            ..Default::default()
        };
        let ancient = CloudResource {
            id: "snap-old".into(),
            size_gb: Some(10.0),
            created_at: Some(Utc::now() - chrono::Duration::days(120)),
            ..Default::default()
        };
        let api = StubApi::new().with_resources(ResourceKind::Snapshot, vec![recent, ancient]);
        let items = OldSnapshotsPlugin.scan(&context(api)).await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].resource_id, "snap-old");
        assert!(items[0].age_days.unwrap() >= 120);
    }

    #[tokio::test]
    async fn gpu_instances_are_flagged() {
        let instance = CloudResource {
            id: "i-1".into(),
            state: Some("running".into()),
            instance_type: Some("p3.2xlarge".into()),
            ..Default::default()
        };
        let api = StubApi::new()
            .with_resources(ResourceKind::Instance, vec![instance])
            .with_metric(1.0);
        let items = IdleInstancesPlugin.scan(&context(api)).await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].is_gpu, Some(serde_json::json!(true)));
        assert_eq!(items[0].monthly_cost, dec!(540.00));
    }
}
