//! GCP provider client (Compute/Monitoring REST + BigQuery billing export).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use super::api::{
    CloudAdapter, CloudResource, Granularity, Provider, ProviderApi, ResourceKind, UsageRecord,
};
use super::GcpConnection;

const API_TIMEOUT: Duration = Duration::from_secs(25);
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Clone)]
pub struct GcpApi {
    http: reqwest::Client,
    project_id: String,
    service_account_json: String,
    billing_export_table: Option<String>,
    token_cache: Arc<Mutex<Option<(String, DateTime<Utc>)>>>,
}

impl GcpApi {
    pub fn new(connection: &GcpConnection) -> Self {
        Self {
            http: reqwest::Client::new(),
            project_id: connection.project_id.clone(),
            service_account_json: connection.service_account_json.clone(),
            billing_export_table: connection.billing_export_table.clone(),
            token_cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Service-account JWT-bearer exchange, cached until shortly before
    /// expiry.
    async fn access_token(&self) -> Result<String> {
        let mut cache = self.token_cache.lock().await;
        if let Some((token, expires_at)) = cache.as_ref() {
            if *expires_at > Utc::now() + chrono::Duration::seconds(60) {
                return Ok(token.clone());
            }
        }

        let key: ServiceAccountKey = serde_json::from_str(&self.service_account_json)
            .context("gcp connection carries an invalid service account key")?;

        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: key.client_email.clone(),
            scope: OAUTH_SCOPE.to_string(),
            aud: key.token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_rsa_pem(key.private_key.as_bytes())
                .context("gcp service account private key is not valid PEM")?,
        )?;

        let response: Value = self
            .http
            .post(&key.token_uri)
            .timeout(API_TIMEOUT)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let token = response["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("gcp token response missing access_token"))?
            .to_string();
        let expires_in = response["expires_in"].as_i64().unwrap_or(3600);
        *cache = Some((token.clone(), Utc::now() + chrono::Duration::seconds(expires_in)));
        Ok(token)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .timeout(API_TIMEOUT)
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("gcp GET {url} returned {status}: {text}"));
        }
        Ok(response.json().await?)
    }

    fn parse_compute_resource(entry: &Value) -> CloudResource {
        let mut tags = std::collections::HashMap::new();
        if let Some(labels) = entry["labels"].as_object() {
            for (key, value) in labels {
                if let Some(v) = value.as_str() {
                    tags.insert(key.clone(), v.to_string());
                }
            }
        }

        CloudResource {
            // selfLink doubles as the remediation target.
            id: entry["selfLink"]
                .as_str()
                .or_else(|| entry["name"].as_str())
                .unwrap_or_default()
                .to_string(),
            name: entry["name"].as_str().map(str::to_string),
            state: entry["status"].as_str().map(str::to_string),
            size_gb: entry["sizeGb"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .or_else(|| entry["sizeGb"].as_f64()),
            instance_type: entry["machineType"].as_str().map(str::to_string),
            created_at: entry["creationTimestamp"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            region: entry["zone"]
                .as_str()
                .or_else(|| entry["region"].as_str())
                .and_then(|z| z.rsplit('/').next())
                .map(str::to_string),
            attachments: Some(
                entry["users"].as_array().map(|u| u.len() as i64).unwrap_or(0),
            ),
            tags,
        }
    }

    /// Aggregated list endpoints nest resources under per-scope keys.
    fn collect_aggregated(response: &Value, kind_key: &str) -> Vec<CloudResource> {
        let mut resources = Vec::new();
        if let Some(items) = response["items"].as_object() {
            for scope in items.values() {
                for entry in scope[kind_key].as_array().into_iter().flatten() {
                    resources.push(Self::parse_compute_resource(entry));
                }
            }
        }
        resources
    }
}

#[async_trait]
impl ProviderApi for GcpApi {
    fn provider(&self) -> Provider {
        Provider::Gcp
    }

    async fn list_resources(&self, kind: ResourceKind) -> Result<Vec<CloudResource>> {
        let base = format!(
            "https://compute.googleapis.com/compute/v1/projects/{}",
            self.project_id
        );
        match kind {
            ResourceKind::Disk => {
                let response = self.get_json(&format!("{base}/aggregated/disks")).await?;
                Ok(Self::collect_aggregated(&response, "disks"))
            }
            ResourceKind::PublicIp => {
                let response = self.get_json(&format!("{base}/aggregated/addresses")).await?;
                Ok(Self::collect_aggregated(&response, "addresses"))
            }
            ResourceKind::MachineImage => {
                let response = self.get_json(&format!("{base}/global/machineImages")).await?;
                Ok(response["items"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .map(Self::parse_compute_resource)
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn metric_sum(
        &self,
        resource_id: &str,
        metric: &str,
        lookback_days: u32,
    ) -> Result<f64> {
        let end = Utc::now();
        let start = end - chrono::Duration::days(lookback_days as i64);
        let filter = format!(
            "metric.type=\"{metric}\" AND resource.labels.instance_id=\"{resource_id}\""
        );
        let url = format!(
            "https://monitoring.googleapis.com/v3/projects/{}/timeSeries\
             ?filter={}&interval.startTime={}&interval.endTime={}",
            self.project_id,
            urlencode(&filter),
            start.format("%Y-%m-%dT%H:%M:%SZ"),
            end.format("%Y-%m-%dT%H:%M:%SZ"),
        );
        let response = self.get_json(&url).await?;

        let total = response["timeSeries"]
            .as_array()
            .into_iter()
            .flatten()
            .flat_map(|series| series["points"].as_array().into_iter().flatten())
            .filter_map(|point| {
                point["value"]["doubleValue"]
                    .as_f64()
                    .or_else(|| point["value"]["int64Value"].as_str()?.parse().ok())
            })
            .sum();
        Ok(total)
    }

    async fn execute_action(&self, action: &str, resource_id: &str) -> Result<()> {
        // Compute resources are addressed by selfLink; deletion is uniform.
        if !resource_id.starts_with("https://") {
            return Err(anyhow!(
                "unsupported gcp action {action} for resource {resource_id}: selfLink required"
            ));
        }
        let token = self.access_token().await?;
        let response = self
            .http
            .delete(resource_id)
            .timeout(API_TIMEOUT)
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("gcp DELETE {resource_id} returned {status}: {text}"));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudAdapter for GcpApi {
    async fn stream_cost_and_usage(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _granularity: Granularity,
    ) -> Result<BoxStream<'static, Result<UsageRecord>>> {
        let Some(table) = self.billing_export_table.clone() else {
            warn!(project_id = %self.project_id, "gcp_billing_export_not_configured");
            return Ok(stream::empty().boxed());
        };

        let query = format!(
            "SELECT service.description AS service, usage_start_time, \
                    SUM(cost) AS cost, SUM(usage.amount) AS usage_amount \
             FROM `{table}` \
             WHERE usage_start_time >= TIMESTAMP('{}') \
               AND usage_start_time < TIMESTAMP('{}') \
             GROUP BY service, usage_start_time",
            start.format("%Y-%m-%d %H:%M:%S"),
            end.format("%Y-%m-%d %H:%M:%S"),
        );

        let token = self.access_token().await?;
        let url = format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/queries",
            self.project_id
        );
        let response: Value = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(60))
            .bearer_auth(token)
            .json(&json!({ "query": query, "useLegacySql": false }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let records = parse_bigquery_rows(&response);
        Ok(stream::iter(records.into_iter().map(Ok)).boxed())
    }
}

/// BigQuery answers rows as `{"f": [{"v": ...}, ...]}` in schema order:
/// service, usage_start_time (epoch seconds), cost, usage_amount.
fn parse_bigquery_rows(response: &Value) -> Vec<UsageRecord> {
    let mut records = Vec::new();
    for row in response["rows"].as_array().into_iter().flatten() {
        let cells = row["f"].as_array();
        let cell = |i: usize| -> Option<&Value> { cells.and_then(|c| c.get(i)).map(|c| &c["v"]) };

        let service = cell(0)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let occurred_at = cell(1)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
            .unwrap_or_else(Utc::now);
        let cost = cell(2)
            .and_then(Value::as_str)
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or_default();
        let usage_amount = cell(3)
            .and_then(Value::as_str)
            .and_then(|s| Decimal::from_str(s).ok());

        records.push(UsageRecord {
            occurred_at,
            service,
            resource_id: None,
            region: None,
            cost_usd: cost,
            usage_amount,
            usage_unit: None,
        });
    }
    records
}

fn urlencode(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => c.to_string(),
            other => format!("%{:02X}", other as u32),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_disk_entry() {
        let entry = json!({
            "name": "batch-scratch",
            "selfLink": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a/disks/batch-scratch",
            "status": "READY",
            "sizeGb": "500",
            "creationTimestamp": "2025-09-12T07:00:00Z",
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a",
            "users": [],
            "labels": { "owner": "batch" }
        });
        let resource = GcpApi::parse_compute_resource(&entry);
        assert_eq!(resource.size_gb, Some(500.0));
        assert_eq!(resource.attachments, Some(0));
        assert_eq!(resource.region.as_deref(), Some("us-central1-a"));
        assert!(resource.id.starts_with("https://"));
    }

    #[test]
    fn aggregated_scopes_are_flattened() {
        let response = json!({
            "items": {
                "zones/us-central1-a": { "disks": [{ "name": "a", "users": [] }] },
                "zones/europe-west1-b": { "disks": [{ "name": "b", "users": ["vm"] }] }
            }
        });
        let resources = GcpApi::collect_aggregated(&response, "disks");
        assert_eq!(resources.len(), 2);
    }

    #[test]
    fn bigquery_rows_parse_in_schema_order() {
        let response = json!({
            "rows": [{
                "f": [
                    { "v": "Compute Engine" },
                    { "v": "1767225600.0" },
                    { "v": "12.5" },
                    { "v": "3.0" }
                ]
            }]
        });
        let records = parse_bigquery_rows(&response);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].service, "Compute Engine");
        assert_eq!(records[0].cost_usd, Decimal::from_str("12.5").unwrap());
    }

    #[test]
    fn urlencode_escapes_quotes_and_spaces() {
        assert_eq!(urlencode("a b\"c"), "a%20b%22c");
    }
}
