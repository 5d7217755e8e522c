//! Application context: process-wide state with lifecycle tied to startup.
//!
//! External services sit behind trait objects so handlers stay testable; the
//! optional ones (Slack, Paystack, the analyzer) degrade to "skipped" results
//! rather than failures when unconfigured.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::config::Config;
use crate::domains::analysis::{LlmAnalyzer, UsageAnalyzer};
use crate::domains::billing::{BillingGateway, PaystackGateway};
use crate::domains::notifications::{NotificationSink, SlackSink};
use crate::domains::remediation::{build_action_limiter, ActionLimiter};
use crate::domains::zombies::ZombieScanService;
use crate::kernel::jobs::JobStore;

#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub pool: PgPool,
    pub store: JobStore,
    pub notifications: Option<Arc<dyn NotificationSink>>,
    pub billing: Option<Arc<dyn BillingGateway>>,
    pub analyzer: Option<Arc<dyn UsageAnalyzer>>,
    pub action_limiter: Arc<dyn ActionLimiter>,
}

impl AppContext {
    pub async fn new(config: Config, pool: PgPool) -> Self {
        let store = JobStore::with_backoff_base(pool.clone(), config.backoff_base_seconds);
        let notifications = SlackSink::from_config(&config);
        let billing = PaystackGateway::from_config(&config);
        let analyzer = LlmAnalyzer::from_config(&config);
        let action_limiter = build_action_limiter(config.redis_url.as_deref()).await;

        Self {
            config,
            pool,
            store,
            notifications,
            billing,
            analyzer,
            action_limiter,
        }
    }

    /// Zombie orchestrator wired with this context's deadlines and sinks.
    pub fn zombie_service(&self) -> ZombieScanService {
        ZombieScanService::new(self.store.clone(), self.notifications.clone()).with_deadlines(
            Duration::from_secs(self.config.zombie_plugin_timeout_seconds),
            Duration::from_secs(self.config.zombie_scan_deadline_seconds),
        )
    }
}
