//! GCP detection plugins. Disk and address keys are provider-specific and
//! normalized by the orchestrator; machine images map to `orphaned_images`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use super::plugin::{estimated_costs, ScanContext, WasteItem, ZombiePlugin};
use crate::domains::connections::{CloudResource, ResourceKind};

pub fn plugins() -> Vec<Arc<dyn ZombiePlugin>> {
    vec![
        Arc::new(UnattachedDisksPlugin),
        Arc::new(UnusedStaticIpsPlugin),
        Arc::new(OrphanedMachineImagesPlugin),
    ]
}

async fn list_or_empty(ctx: &ScanContext, kind: ResourceKind, plugin: &str) -> Vec<CloudResource> {
    match ctx.api.list_resources(kind).await {
        Ok(resources) => resources,
        Err(e) => {
            warn!(plugin, error = %e, "plugin_inventory_failed");
            Vec::new()
        }
    }
}

pub struct UnattachedDisksPlugin;

#[async_trait]
impl ZombiePlugin for UnattachedDisksPlugin {
    fn category_key(&self) -> &'static str {
        "unattached_disks"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        let mut zombies = Vec::new();
        for disk in list_or_empty(ctx, ResourceKind::Disk, self.category_key()).await {
            // READY disks with no users are allocated but serve no VM.
            if disk.state.as_deref() != Some("READY") || disk.attachments.unwrap_or(0) > 0 {
                continue;
            }

            let gb = Decimal::from_f64(disk.size_gb.unwrap_or(0.0)).unwrap_or_default();
            let mut item = WasteItem::new(
                &disk.id,
                "Persistent Disk",
                (gb * estimated_costs::MANAGED_DISK_GB).round_dp(2),
                "delete_disk",
            );
            item.resource_name = disk.name.clone();
            item.size_gb = disk.size_gb;
            item.backup_cost_monthly = (gb * estimated_costs::SNAPSHOT_GB).round_dp(2);
            item.recommendation = "Delete if no longer needed".into();
            item.supports_backup = true;
            item.explainability_notes =
                "Disk is READY with zero attached users.".into();
            item.confidence_score = 0.96;
            item.owner = disk.owner_tag().map(|o| o.into());
            zombies.push(item);
        }
        zombies
    }
}

pub struct UnusedStaticIpsPlugin;

#[async_trait]
impl ZombiePlugin for UnusedStaticIpsPlugin {
    fn category_key(&self) -> &'static str {
        "orphaned_ips"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        let mut zombies = Vec::new();
        for address in list_or_empty(ctx, ResourceKind::PublicIp, self.category_key()).await {
            if address.state.as_deref() != Some("RESERVED") {
                continue;
            }

            let mut item = WasteItem::new(
                &address.id,
                "Static IP",
                estimated_costs::ELASTIC_IP,
                "release_ip",
            );
            item.resource_name = address.name.clone();
            item.recommendation = "Release the address".into();
            item.explainability_notes =
                "Static address is RESERVED but not IN_USE by any resource.".into();
            item.confidence_score = 0.96;
            zombies.push(item);
        }
        zombies
    }
}

pub struct OrphanedMachineImagesPlugin;

#[async_trait]
impl ZombiePlugin for OrphanedMachineImagesPlugin {
    fn category_key(&self) -> &'static str {
        "orphaned_images"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        const STALE_DAYS: i64 = 120;

        let mut zombies = Vec::new();
        for image in list_or_empty(ctx, ResourceKind::MachineImage, self.category_key()).await {
            let Some(created) = image.created_at else { continue };
            let age = (Utc::now() - created).num_days();
            if age < STALE_DAYS {
                continue;
            }

            let gb = Decimal::from_f64(image.size_gb.unwrap_or(10.0)).unwrap_or_default();
            let mut item = WasteItem::new(
                &image.id,
                "Machine Image",
                (gb * estimated_costs::MACHINE_IMAGE_GB).round_dp(2),
                "delete_image",
            );
            item.resource_name = image.name.clone();
            item.age_days = Some(age);
            item.recommendation = "Delete if the source VM is gone".into();
            item.explainability_notes =
                format!("Machine image is {age} days old and unused.");
            item.confidence_score = 0.85;
            zombies.push(item);
        }
        zombies
    }
}
