//! Handler registry: maps job types to their execution capability.
//!
//! The set of handlers is closed at process start; nothing registers at
//! runtime. The processor resolves the claimed job's type here and dispatches
//! with the job and a tenant-scoped session.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::job::{BackgroundJob, JobType};
use super::JobError;
use crate::db::session::TenantSession;

/// Execution capability for one job type.
///
/// Handlers are stateless with respect to each other and must be idempotent:
/// a worker may crash after the handler succeeded but before the completion
/// write committed, in which case the job runs again.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(
        &self,
        job: &BackgroundJob,
        session: &mut TenantSession<'_>,
    ) -> Result<Value>;
}

impl std::fmt::Debug for dyn JobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn JobHandler")
    }
}

/// Registry populated once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: JobType) -> Result<Arc<dyn JobHandler>, JobError> {
        self.handlers
            .get(&job_type)
            .cloned()
            .ok_or(JobError::UnknownHandler(job_type))
    }

    pub fn is_registered(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }
}
