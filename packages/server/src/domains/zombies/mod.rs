//! Multi-cloud zombie-resource detection.
//!
//! ```text
//! ZombieScanService.scan_for_tenant
//!     │
//!     ├─► connections_for_tenant (AWS + Azure + GCP tables)
//!     ├─► factory: one ZombieDetector per connection
//!     │       └─► plugins run in parallel, per-plugin timeout,
//!     │           checkpoint callback per completed category
//!     ├─► normalization + tier-gated annotation
//!     └─► optional zombie_analysis enqueue + best-effort notification
//! ```

pub mod aws;
pub mod azure;
mod detector;
mod factory;
pub mod gcp;
mod plugin;
mod service;
#[cfg(test)]
pub mod testing;

pub use detector::{CheckpointFn, DetectorScan, ZombieDetector};
pub use factory::detector_for_connection;
pub use plugin::{estimated_costs, ScanContext, WasteItem, ZombiePlugin};
pub use service::{
    canonical_key, ConnectionScanSummary, DetectorFactory, ScanReport, ZombieScanService,
    CANONICAL_CATEGORIES, PLUGIN_TIMEOUT_SECONDS, SCAN_DEADLINE_SECONDS,
};
