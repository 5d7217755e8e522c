// Main entry point for the Skysweep API server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use skysweep_core::db::connect_pool;
use skysweep_core::kernel::scheduler::SchedulerOrchestrator;
use skysweep_core::kernel::AppContext;
use skysweep_core::server::{build_app, AppState};
use skysweep_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,skysweep_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Skysweep cloud cost governance API");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(environment = %config.environment, "Configuration loaded");

    // Metrics recorder (Prometheus scrape endpoint on :9000)
    if let Err(e) = PrometheusBuilder::new().install() {
        tracing::warn!(error = %e, "metrics recorder not installed");
    }

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = connect_pool(&config).await?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let port = config.port;
    let ctx = Arc::new(AppContext::new(config, pool).await);
    let state = AppState::new(ctx.clone());

    // Cohort scheduler (cron triggers feeding the job queue)
    let orchestrator = SchedulerOrchestrator::new(ctx.clone());
    let _scheduler = orchestrator
        .start()
        .await
        .context("Failed to start scheduler")?;

    // In-process poller: re-invokes the processor so jobs drain even when no
    // external cron hits the internal endpoint.
    {
        let processor = state.processor.clone();
        let batch_limit = ctx.config.max_jobs_per_batch;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let report = processor.process_due_batch(batch_limit).await;
                if report.processed > 0 {
                    tracing::debug!(
                        processed = report.processed,
                        succeeded = report.succeeded,
                        failed = report.failed,
                        "poller_batch_complete"
                    );
                }
            }
        });
    }

    // Build and serve the application
    let app = build_app(state);
    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Starting server on {addr}");
    tracing::info!("Health check: http://localhost:{port}/health");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}
