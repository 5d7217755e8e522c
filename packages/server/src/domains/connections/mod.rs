//! Cloud connection records and provider client construction.
//!
//! Each tenant links one or more cloud accounts; a connection row carries the
//! credentials needed to build the provider client. Dispatch over providers
//! is a tagged enum, not inheritance: everything downstream works against the
//! [`api::ProviderApi`] / [`api::CloudAdapter`] traits.

pub mod api;
pub mod aws;
pub mod azure;
pub mod gcp;
pub mod sigv4;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

pub use api::{CloudAdapter, CloudResource, Granularity, Provider, ProviderApi, ResourceKind, UsageRecord};

use crate::db::session::TenantSession;

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct AwsConnection {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub region: String,
    pub aws_account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct AzureConnection {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub azure_tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub subscription_id: String,
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct GcpConnection {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub project_id: String,
    pub service_account_json: String,
    /// Fully-qualified BigQuery table with the billing export, if configured.
    pub billing_export_table: Option<String>,
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// A connection of any provider.
#[derive(Debug, Clone)]
pub enum CloudConnection {
    Aws(AwsConnection),
    Azure(AzureConnection),
    Gcp(GcpConnection),
}

impl CloudConnection {
    pub fn id(&self) -> Uuid {
        match self {
            CloudConnection::Aws(c) => c.id,
            CloudConnection::Azure(c) => c.id,
            CloudConnection::Gcp(c) => c.id,
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        match self {
            CloudConnection::Aws(c) => c.tenant_id,
            CloudConnection::Azure(c) => c.tenant_id,
            CloudConnection::Gcp(c) => c.tenant_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CloudConnection::Aws(c) => &c.name,
            CloudConnection::Azure(c) => &c.name,
            CloudConnection::Gcp(c) => &c.name,
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            CloudConnection::Aws(_) => Provider::Aws,
            CloudConnection::Azure(_) => Provider::Azure,
            CloudConnection::Gcp(_) => Provider::Gcp,
        }
    }

    /// Region scans run against. Azure and GCP inventories are global.
    pub fn scan_region(&self, requested: Option<&str>) -> String {
        match self {
            CloudConnection::Aws(c) => requested.unwrap_or(&c.region).to_string(),
            CloudConnection::Azure(_) | CloudConnection::Gcp(_) => "global".to_string(),
        }
    }
}

/// All of a tenant's connections across the three provider tables.
pub async fn connections_for_tenant(
    session: &mut TenantSession<'_>,
    tenant_id: Uuid,
) -> Result<Vec<CloudConnection>> {
    let mut connections = Vec::new();

    let sql = "SELECT id, tenant_id, name, region, aws_account_id, access_key_id, \
               secret_access_key, last_ingested_at, error_message \
               FROM aws_connections WHERE tenant_id = $1";
    let aws = sqlx::query_as::<_, AwsConnection>(sql)
        .bind(tenant_id)
        .fetch_all(session.executor(sql)?)
        .await?;
    connections.extend(aws.into_iter().map(CloudConnection::Aws));

    let sql = "SELECT id, tenant_id, name, azure_tenant_id, client_id, client_secret, \
               subscription_id, last_ingested_at, error_message \
               FROM azure_connections WHERE tenant_id = $1";
    let azure = sqlx::query_as::<_, AzureConnection>(sql)
        .bind(tenant_id)
        .fetch_all(session.executor(sql)?)
        .await?;
    connections.extend(azure.into_iter().map(CloudConnection::Azure));

    let sql = "SELECT id, tenant_id, name, project_id, service_account_json, \
               billing_export_table, last_ingested_at, error_message \
               FROM gcp_connections WHERE tenant_id = $1";
    let gcp = sqlx::query_as::<_, GcpConnection>(sql)
        .bind(tenant_id)
        .fetch_all(session.executor(sql)?)
        .await?;
    connections.extend(gcp.into_iter().map(CloudConnection::Gcp));

    Ok(connections)
}

/// Record a successful ingestion run on the connection row.
pub async fn mark_ingested(
    conn: &mut PgConnection,
    connection: &CloudConnection,
) -> Result<()> {
    let table = match connection.provider() {
        Provider::Aws => "aws_connections",
        Provider::Azure => "azure_connections",
        Provider::Gcp => "gcp_connections",
    };
    let sql = format!(
        "UPDATE {table} SET last_ingested_at = NOW(), error_message = NULL WHERE id = $1"
    );
    sqlx::query(&sql).bind(connection.id()).execute(conn).await?;
    Ok(())
}

/// Record an ingestion failure on the connection row (truncated).
pub async fn mark_ingest_error(
    conn: &mut PgConnection,
    connection: &CloudConnection,
    error: &str,
) -> Result<()> {
    let table = match connection.provider() {
        Provider::Aws => "aws_connections",
        Provider::Azure => "azure_connections",
        Provider::Gcp => "gcp_connections",
    };
    let sql = format!("UPDATE {table} SET error_message = $2 WHERE id = $1");
    let truncated: String = error.chars().take(255).collect();
    sqlx::query(&sql)
        .bind(connection.id())
        .bind(truncated)
        .execute(conn)
        .await?;
    Ok(())
}

/// Build the adapter for a connection. Dispatch is a closed match over the
/// provider tag; credentials come from the connection row.
pub fn build_adapter(
    connection: &CloudConnection,
    region: Option<&str>,
) -> Arc<dyn CloudAdapter> {
    match connection {
        CloudConnection::Aws(c) => Arc::new(aws::AwsApi::new(c, region)),
        CloudConnection::Azure(c) => Arc::new(azure::AzureApi::new(c)),
        CloudConnection::Gcp(c) => Arc::new(gcp::GcpApi::new(c)),
    }
}
