//! Azure provider client (ARM + Cost Management, bearer-token REST).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::api::{
    CloudAdapter, CloudResource, Granularity, Provider, ProviderApi, ResourceKind, UsageRecord,
};
use super::AzureConnection;

const ARM_BASE: &str = "https://management.azure.com";
const API_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Clone)]
pub struct AzureApi {
    http: reqwest::Client,
    azure_tenant_id: String,
    client_id: String,
    client_secret: String,
    subscription_id: String,
    token_cache: Arc<Mutex<Option<(String, DateTime<Utc>)>>>,
}

impl AzureApi {
    pub fn new(connection: &AzureConnection) -> Self {
        Self {
            http: reqwest::Client::new(),
            azure_tenant_id: connection.azure_tenant_id.clone(),
            client_id: connection.client_id.clone(),
            client_secret: connection.client_secret.clone(),
            subscription_id: connection.subscription_id.clone(),
            token_cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Client-credentials token for the ARM scope, cached until shortly
    /// before expiry.
    async fn access_token(&self) -> Result<String> {
        let mut cache = self.token_cache.lock().await;
        if let Some((token, expires_at)) = cache.as_ref() {
            if *expires_at > Utc::now() + chrono::Duration::seconds(60) {
                return Ok(token.clone());
            }
        }

        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.azure_tenant_id
        );
        let response: Value = self
            .http
            .post(&url)
            .timeout(API_TIMEOUT)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", "https://management.azure.com/.default"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let token = response["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("azure token response missing access_token"))?
            .to_string();
        let expires_in = response["expires_in"].as_i64().unwrap_or(3600);
        *cache = Some((token.clone(), Utc::now() + chrono::Duration::seconds(expires_in)));
        Ok(token)
    }

    async fn arm_get(&self, path_and_query: &str) -> Result<Value> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{ARM_BASE}{path_and_query}"))
            .timeout(API_TIMEOUT)
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("azure GET {path_and_query} returned {status}: {text}"));
        }
        Ok(response.json().await?)
    }

    fn parse_resource(entry: &Value) -> CloudResource {
        let properties = &entry["properties"];
        let mut tags = std::collections::HashMap::new();
        if let Some(map) = entry["tags"].as_object() {
            for (key, value) in map {
                if let Some(v) = value.as_str() {
                    tags.insert(key.clone(), v.to_string());
                }
            }
        }

        // `ipConfiguration` set means the public IP is associated; `managedBy`
        // set means the disk is attached.
        let attachments = if properties.get("ipConfiguration").map_or(false, |v| !v.is_null())
            || entry.get("managedBy").map_or(false, |v| !v.is_null())
        {
            Some(1)
        } else {
            Some(0)
        };

        CloudResource {
            id: entry["id"].as_str().unwrap_or_default().to_string(),
            name: entry["name"].as_str().map(str::to_string),
            state: properties["diskState"]
                .as_str()
                .or_else(|| properties["provisioningState"].as_str())
                .map(str::to_string),
            size_gb: properties["diskSizeGB"].as_f64(),
            instance_type: entry["sku"]["name"].as_str().map(str::to_string),
            created_at: properties["timeCreated"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            region: entry["location"].as_str().map(str::to_string),
            attachments,
            tags,
        }
    }
}

#[async_trait]
impl ProviderApi for AzureApi {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    async fn list_resources(&self, kind: ResourceKind) -> Result<Vec<CloudResource>> {
        let path = match kind {
            ResourceKind::Disk => format!(
                "/subscriptions/{}/providers/Microsoft.Compute/disks?api-version=2023-04-02",
                self.subscription_id
            ),
            ResourceKind::PublicIp => format!(
                "/subscriptions/{}/providers/Microsoft.Network/publicIPAddresses?api-version=2023-09-01",
                self.subscription_id
            ),
            _ => return Ok(Vec::new()),
        };

        let mut resources = Vec::new();
        let mut next: Option<String> = Some(path);
        while let Some(current) = next.take() {
            // nextLink is absolute; first request is ARM-relative.
            let response = if current.starts_with("http") {
                let token = self.access_token().await?;
                self.http
                    .get(&current)
                    .timeout(API_TIMEOUT)
                    .bearer_auth(token)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<Value>()
                    .await?
            } else {
                self.arm_get(&current).await?
            };

            for entry in response["value"].as_array().into_iter().flatten() {
                resources.push(Self::parse_resource(entry));
            }
            next = response["nextLink"].as_str().map(str::to_string);
        }
        Ok(resources)
    }

    async fn metric_sum(
        &self,
        resource_id: &str,
        metric: &str,
        lookback_days: u32,
    ) -> Result<f64> {
        let end = Utc::now();
        let start = end - chrono::Duration::days(lookback_days as i64);
        let path = format!(
            "{resource_id}/providers/microsoft.insights/metrics\
             ?api-version=2018-01-01&metricnames={metric}&aggregation=Total\
             &timespan={}/{}",
            start.format("%Y-%m-%dT%H:%M:%SZ"),
            end.format("%Y-%m-%dT%H:%M:%SZ"),
        );
        let response = self.arm_get(&path).await?;

        let total = response["value"]
            .as_array()
            .into_iter()
            .flatten()
            .flat_map(|series| series["timeseries"].as_array().into_iter().flatten())
            .flat_map(|ts| ts["data"].as_array().into_iter().flatten())
            .filter_map(|point| point["total"].as_f64())
            .sum();
        Ok(total)
    }

    async fn execute_action(&self, _action: &str, resource_id: &str) -> Result<()> {
        // ARM remediation is uniform: delete the resource by its full id.
        let token = self.access_token().await?;
        let url = format!("{ARM_BASE}{resource_id}?api-version=2023-04-02");
        let response = self
            .http
            .delete(&url)
            .timeout(API_TIMEOUT)
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("azure DELETE {resource_id} returned {status}: {text}"));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudAdapter for AzureApi {
    async fn stream_cost_and_usage(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<BoxStream<'static, Result<UsageRecord>>> {
        let api = self.clone();
        let body = json!({
            "type": "ActualCost",
            "timeframe": "Custom",
            "timePeriod": {
                "from": start.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                "to": end.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            },
            "dataset": {
                "granularity": match granularity {
                    Granularity::Hourly => "Hourly",
                    Granularity::Daily => "Daily",
                },
                "aggregation": { "totalCost": { "name": "Cost", "function": "Sum" } },
                "grouping": [{ "type": "Dimension", "name": "ServiceName" }]
            }
        });

        let first_url = format!(
            "{ARM_BASE}/subscriptions/{}/providers/Microsoft.CostManagement/query?api-version=2023-03-01",
            api.subscription_id
        );

        let pages = stream::try_unfold(
            (api, Some(first_url), body),
            move |(api, url, body)| async move {
                let Some(url) = url else {
                    return Ok::<_, anyhow::Error>(None);
                };
                let token = api.access_token().await?;
                let response: Value = api
                    .http
                    .post(&url)
                    .timeout(API_TIMEOUT)
                    .bearer_auth(token)
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;

                let records = parse_cost_rows(&response);
                let next = response["properties"]["nextLink"]
                    .as_str()
                    .map(str::to_string);
                Ok(Some((records, (api, next, body))))
            },
        );

        let records = pages
            .map(|page: Result<Vec<UsageRecord>>| match page {
                Ok(records) => stream::iter(records.into_iter().map(Ok)).left_stream(),
                Err(e) => stream::iter(vec![Err(e)]).right_stream(),
            })
            .flatten()
            .boxed();
        Ok(records)
    }
}

/// Cost Management answers with a column-described row matrix.
fn parse_cost_rows(response: &Value) -> Vec<UsageRecord> {
    let properties = &response["properties"];
    let columns: Vec<&str> = properties["columns"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|c| c["name"].as_str())
        .collect();
    let index_of = |name: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(name));

    let cost_idx = index_of("Cost");
    let date_idx = index_of("UsageDate");
    let service_idx = index_of("ServiceName");

    let mut records = Vec::new();
    for row in properties["rows"].as_array().into_iter().flatten() {
        let Some(cells) = row.as_array() else { continue };
        let cost = cost_idx
            .and_then(|i| cells.get(i))
            .and_then(value_to_decimal)
            .unwrap_or_default();
        let occurred_at = date_idx
            .and_then(|i| cells.get(i))
            .and_then(parse_usage_date)
            .unwrap_or_else(Utc::now);
        let service = service_idx
            .and_then(|i| cells.get(i))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        records.push(UsageRecord {
            occurred_at,
            service,
            resource_id: None,
            region: None,
            cost_usd: cost,
            usage_amount: None,
            usage_unit: Some("USD".to_string()),
        });
    }
    records
}

fn value_to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

/// UsageDate arrives as the integer `20260115`.
fn parse_usage_date(value: &Value) -> Option<DateTime<Utc>> {
    let digits = match value {
        Value::Number(n) => n.as_i64()?.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    chrono::NaiveDate::parse_from_str(&digits, "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
