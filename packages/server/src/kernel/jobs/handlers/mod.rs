//! Job handlers, one per job type.
//!
//! Handlers receive the claimed job and a tenant-scoped session and return a
//! JSON result. They are idempotent: the processor may re-run a job whose
//! completion write never committed.

mod billing;
mod costs;
mod finops;
mod notifications;
mod remediation;
mod webhook;
mod zombie;

pub use webhook::{store_webhook, webhook_idempotency_key};

use std::sync::Arc;

use super::registry::HandlerRegistry;
use super::JobType;
use crate::kernel::AppContext;

/// The full handler set, registered once at startup.
pub fn build_registry(ctx: Arc<AppContext>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.register(
        JobType::FinopsAnalysis,
        Arc::new(finops::FinOpsAnalysisHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::ZombieScan,
        Arc::new(zombie::ZombieScanHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::ZombieAnalysis,
        Arc::new(zombie::ZombieAnalysisHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::Remediation,
        Arc::new(remediation::RemediationHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::WebhookRetry,
        Arc::new(webhook::WebhookRetryHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::Notification,
        Arc::new(notifications::NotificationHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::CostIngestion,
        Arc::new(costs::CostIngestionHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::RecurringBilling,
        Arc::new(billing::RecurringBillingHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::ReportGeneration,
        Arc::new(costs::ReportGenerationHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::CostForecast,
        Arc::new(costs::CostForecastHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::CostExport,
        Arc::new(costs::CostExportHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::CostAggregation,
        Arc::new(costs::CostAggregationHandler::new(ctx.clone())),
    );
    registry.register(
        JobType::Dunning,
        Arc::new(billing::DunningHandler::new(ctx)),
    );

    registry
}
