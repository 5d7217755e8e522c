//! Azure detection plugins. Keys are provider-specific and normalized by the
//! orchestrator (`unattached_disks` -> `unattached_volumes`, `orphaned_ips`
//! -> `unused_elastic_ips`).

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use super::plugin::{estimated_costs, ScanContext, WasteItem, ZombiePlugin};
use crate::domains::connections::ResourceKind;

pub fn plugins() -> Vec<Arc<dyn ZombiePlugin>> {
    vec![
        Arc::new(UnattachedDisksPlugin),
        Arc::new(OrphanedPublicIpsPlugin),
    ]
}

pub struct UnattachedDisksPlugin;

#[async_trait]
impl ZombiePlugin for UnattachedDisksPlugin {
    fn category_key(&self) -> &'static str {
        "unattached_disks"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        let disks = match ctx.api.list_resources(ResourceKind::Disk).await {
            Ok(disks) => disks,
            Err(e) => {
                warn!(plugin = self.category_key(), error = %e, "plugin_inventory_failed");
                return Vec::new();
            }
        };

        let mut zombies = Vec::new();
        for disk in disks {
            if disk.state.as_deref() != Some("Unattached") {
                continue;
            }

            let gb = Decimal::from_f64(disk.size_gb.unwrap_or(0.0)).unwrap_or_default();
            let mut item = WasteItem::new(
                &disk.id,
                "Managed Disk",
                (gb * estimated_costs::MANAGED_DISK_GB).round_dp(2),
                "delete_disk",
            );
            item.resource_name = disk.name.clone();
            item.size_gb = disk.size_gb;
            item.backup_cost_monthly = (gb * estimated_costs::SNAPSHOT_GB).round_dp(2);
            item.recommendation = "Delete if no longer needed".into();
            item.supports_backup = true;
            item.explainability_notes =
                "Disk state is 'Unattached'; no VM references it.".into();
            item.confidence_score = 0.97;
            item.owner = disk.owner_tag().map(|o| o.into());
            zombies.push(item);
        }
        zombies
    }
}

pub struct OrphanedPublicIpsPlugin;

#[async_trait]
impl ZombiePlugin for OrphanedPublicIpsPlugin {
    fn category_key(&self) -> &'static str {
        "orphaned_ips"
    }

    async fn scan(&self, ctx: &ScanContext) -> Vec<WasteItem> {
        let addresses = match ctx.api.list_resources(ResourceKind::PublicIp).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(plugin = self.category_key(), error = %e, "plugin_inventory_failed");
                return Vec::new();
            }
        };

        let mut zombies = Vec::new();
        for address in addresses {
            if address.attachments.unwrap_or(0) > 0 {
                continue;
            }

            let mut item = WasteItem::new(
                &address.id,
                "Public IP",
                estimated_costs::ELASTIC_IP,
                "release_ip",
            );
            item.resource_name = address.name.clone();
            item.recommendation = "Release the address".into();
            item.explainability_notes =
                "Public IP has no ipConfiguration; nothing answers on it.".into();
            item.confidence_score = 0.96;
            item.owner = address.owner_tag().map(|o| o.into());
            zombies.push(item);
        }
        zombies
    }
}
