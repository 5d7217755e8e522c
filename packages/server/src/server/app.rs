//! Application setup and router configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::jobs::{handlers::build_registry, JobProcessor};
use crate::kernel::AppContext;
use crate::server::middleware::jwt_auth_middleware;
use crate::server::routes::jobs::{
    enqueue_job, internal_process_jobs, job_status, list_jobs, process_jobs,
};
use crate::server::routes::health_handler;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
    pub processor: Arc<JobProcessor>,
}

impl AppState {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        let registry = Arc::new(build_registry(ctx.clone()));
        let processor = Arc::new(
            JobProcessor::new(ctx.store.clone(), registry)
                .with_timeout(Duration::from_secs(ctx.config.job_timeout_seconds)),
        );
        Self { ctx, processor }
    }
}

/// Build the HTTP application.
pub fn build_app(state: AppState) -> Router {
    let mut jobs_routes = Router::new()
        .route("/enqueue", post(enqueue_job))
        .route("/list", get(list_jobs))
        .route("/status", get(job_status))
        .route("/process", post(process_jobs))
        .route("/internal/process", post(internal_process_jobs));

    if state.ctx.config.ratelimit_enabled {
        let rate_limit_config = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(10)
                .burst_size(20)
                .use_headers()
                .finish()
                .expect("rate limiter configuration is valid"),
        );
        jobs_routes = jobs_routes.layer(GovernorLayer {
            config: rate_limit_config,
        });
    }

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api/v1/jobs", jobs_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
