//! Tenant-scoped database session.
//!
//! Cross-tenant data leakage is the top security risk in this system, so
//! row-level-security enforcement lives here rather than in each handler.
//! A [`TenantSession`] wraps a connection for its lifetime; when a tenant is
//! attached, `app.current_tenant_id` is set as a transaction-local GUC before
//! any user query runs, and Postgres RLS policies take it from there. A
//! request-bound session *without* a tenant refuses every non-internal
//! statement outright.
//!
//! ```text
//! route / job processor
//!     │
//!     ├─► TenantSession::for_tenant(conn, id)   set_config + enforce
//!     ├─► TenantSession::for_request(conn, None) refuse user-table queries
//!     └─► TenantSession::system(conn)            explicit opt-out
//! ```

use sqlx::PgConnection;
use uuid::Uuid;

use crate::common::metrics;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A request-bound session without tenant context tried to touch a
    /// user table. The statement is refused, never executed.
    #[error("RLS context missing - query execution aborted")]
    RlsContextMissing,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A database session bound to at most one tenant.
pub struct TenantSession<'c> {
    conn: &'c mut PgConnection,
    tenant_id: Option<Uuid>,
    rls_context_set: bool,
}

impl<'c> TenantSession<'c> {
    /// Session for a specific tenant. Sets the session-local tenant id
    /// before the session can run any user query.
    pub async fn for_tenant(
        conn: &'c mut PgConnection,
        tenant_id: Uuid,
    ) -> Result<TenantSession<'c>, SessionError> {
        apply_tenant_context(conn, tenant_id).await?;
        Ok(Self {
            conn,
            tenant_id: Some(tenant_id),
            rls_context_set: true,
        })
    }

    /// Session for a request path. Without a tenant the session is marked
    /// unset and every user-table statement will be refused.
    pub async fn for_request(
        conn: &'c mut PgConnection,
        tenant_id: Option<Uuid>,
    ) -> Result<TenantSession<'c>, SessionError> {
        match tenant_id {
            Some(id) => Self::for_tenant(conn, id).await,
            None => Ok(Self {
                conn,
                tenant_id: None,
                rls_context_set: false,
            }),
        }
    }

    /// Session for background/system work that intentionally runs without a
    /// tenant (system-wide jobs, sweeps). The opt-out is explicit.
    pub fn system(conn: &'c mut PgConnection) -> TenantSession<'c> {
        Self {
            conn,
            tenant_id: None,
            rls_context_set: true,
        }
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        self.tenant_id
    }

    pub fn has_rls_context(&self) -> bool {
        self.rls_context_set
    }

    /// Gatekeeper for every outgoing statement. Internal statements pass;
    /// everything else requires tenant context to have been set.
    pub fn executor(&mut self, statement: &str) -> Result<&mut PgConnection, SessionError> {
        self.check_statement(statement)?;
        Ok(&mut *self.conn)
    }

    fn check_statement(&self, statement: &str) -> Result<(), SessionError> {
        if self.rls_context_set || is_internal_statement(statement) {
            return Ok(());
        }

        metrics::record_rls_context_missing(statement_kind(statement));
        tracing::error!(
            statement = &statement[..statement.len().min(200)],
            "rls_enforcement_violation_detected: query executed without tenant insulation"
        );
        Err(SessionError::RlsContextMissing)
    }
}

/// Transaction-local GUC carrying the tenant id; RLS policies read it via
/// `current_setting('app.current_tenant_id')::uuid`.
pub async fn apply_tenant_context(
    conn: &mut PgConnection,
    tenant_id: Uuid,
) -> Result<(), SessionError> {
    sqlx::query("SELECT set_config('app.current_tenant_id', $1, true)")
        .bind(tenant_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

/// Statements that legitimately run without tenant context: migration
/// bookkeeping, identity lookups that happen before a tenant is known,
/// connection health probes and the context-setting call itself.
fn is_internal_statement(statement: &str) -> bool {
    let s = statement.trim_start().to_ascii_lowercase();
    s.starts_with("select 1")
        || s.starts_with("select version()")
        || s.contains("pg_is_in_recovery")
        || s.contains("set_config")
        || s.contains("_sqlx_migrations")
        || s.contains("from tenants")
        || s.contains("from users")
}

fn statement_kind(statement: &str) -> &'static str {
    match statement
        .split_whitespace()
        .next()
        .map(|w| w.to_ascii_lowercase())
        .as_deref()
    {
        Some("select") => "SELECT",
        Some("insert") => "INSERT",
        Some("update") => "UPDATE",
        Some("delete") => "DELETE",
        _ => "OTHER",
    }
}
