//! AWS provider client.
//!
//! Inventory comes from the Config resource-query API, metrics from
//! CloudWatch and costs from Cost Explorer — all JSON protocols signed with
//! SigV4. Remediation actions go through the EC2 Query API where only the
//! status code matters.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};

use super::api::{
    CloudAdapter, CloudResource, Granularity, Provider, ProviderApi, ResourceKind, UsageRecord,
};
use super::sigv4::{sign_post, AwsCredentials};
use super::AwsConnection;

const API_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Clone)]
pub struct AwsApi {
    http: reqwest::Client,
    credentials: AwsCredentials,
    region: String,
    account_id: String,
}

impl AwsApi {
    pub fn new(connection: &AwsConnection, region: Option<&str>) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials: AwsCredentials {
                access_key_id: connection.access_key_id.clone(),
                secret_access_key: connection.secret_access_key.clone(),
                session_token: None,
            },
            region: region.unwrap_or(&connection.region).to_string(),
            account_id: connection.aws_account_id.clone(),
        }
    }

    /// POST a JSON-protocol call (`X-Amz-Target` style) and parse the body.
    async fn json_call(
        &self,
        service: &str,
        region: &str,
        target: &str,
        content_type: &str,
        body: &Value,
    ) -> Result<Value> {
        let host = format!("{service}.{region}.amazonaws.com");
        let payload = serde_json::to_vec(body)?;
        let signed = sign_post(
            &self.credentials,
            region,
            service,
            &host,
            content_type,
            &payload,
            Utc::now(),
        );

        let mut request = self
            .http
            .post(format!("https://{host}/"))
            .timeout(API_TIMEOUT)
            .header("content-type", content_type)
            .header("x-amz-target", target)
            .body(payload);
        for (name, value) in signed {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("aws {service} {target} returned {status}: {text}"));
        }
        Ok(response.json().await?)
    }

    /// Run a Config resource query and parse the stringified result rows.
    async fn select_config(&self, expression: &str) -> Result<Vec<Value>> {
        let mut rows = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut body = json!({ "Expression": expression, "Limit": 100 });
            if let Some(token) = &next_token {
                body["NextToken"] = json!(token);
            }
            let response = self
                .json_call(
                    "config",
                    &self.region,
                    "StarlingDoveService.SelectResourceConfig",
                    "application/x-amz-json-1.1",
                    &body,
                )
                .await?;

            for result in response["Results"].as_array().into_iter().flatten() {
                if let Some(raw) = result.as_str() {
                    match serde_json::from_str::<Value>(raw) {
                        Ok(parsed) => rows.push(parsed),
                        Err(e) => tracing::warn!(error = %e, "config_result_parse_failed"),
                    }
                }
            }

            next_token = response["NextToken"].as_str().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(rows)
    }

    fn config_resource_type(kind: ResourceKind) -> Option<&'static str> {
        match kind {
            ResourceKind::Volume => Some("AWS::EC2::Volume"),
            ResourceKind::Snapshot => Some("AWS::EC2::Snapshot"),
            ResourceKind::ElasticIp => Some("AWS::EC2::EIP"),
            ResourceKind::Instance => Some("AWS::EC2::Instance"),
            ResourceKind::LoadBalancer => Some("AWS::ElasticLoadBalancingV2::LoadBalancer"),
            ResourceKind::NatGateway => Some("AWS::EC2::NatGateway"),
            ResourceKind::DbInstance => Some("AWS::RDS::DBInstance"),
            ResourceKind::StorageBucket => Some("AWS::S3::Bucket"),
            ResourceKind::ContainerImage => Some("AWS::ECR::Repository"),
            ResourceKind::MlEndpoint => Some("AWS::SageMaker::Endpoint"),
            ResourceKind::WarehouseCluster => Some("AWS::Redshift::Cluster"),
            // Azure/GCP-native kinds have no AWS mapping.
            ResourceKind::Disk | ResourceKind::PublicIp | ResourceKind::MachineImage => None,
        }
    }

    fn parse_resource(row: &Value) -> CloudResource {
        let configuration = &row["configuration"];
        let mut tags = std::collections::HashMap::new();
        for tag in row["tags"].as_array().into_iter().flatten() {
            if let (Some(key), Some(value)) = (tag["key"].as_str(), tag["value"].as_str()) {
                tags.insert(key.to_string(), value.to_string());
            }
        }

        CloudResource {
            id: row["resourceId"].as_str().unwrap_or_default().to_string(),
            name: row["resourceName"].as_str().map(str::to_string),
            state: configuration["state"]["value"]
                .as_str()
                .or_else(|| configuration["state"].as_str())
                .or_else(|| configuration["status"].as_str())
                .map(str::to_string),
            size_gb: configuration["size"]
                .as_f64()
                .or_else(|| configuration["volumeSize"].as_f64())
                .or_else(|| configuration["allocatedStorage"].as_f64()),
            instance_type: configuration["instanceType"]
                .as_str()
                .or_else(|| configuration["dBInstanceClass"].as_str())
                .or_else(|| configuration["nodeType"].as_str())
                .map(str::to_string),
            created_at: row["resourceCreationTime"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            region: row["awsRegion"].as_str().map(str::to_string),
            attachments: configuration["attachments"]
                .as_array()
                .map(|a| a.len() as i64)
                .or_else(|| {
                    configuration["associationId"]
                        .as_str()
                        .map(|_| 1)
                        .or(Some(0))
                }),
            tags,
        }
    }

    fn ec2_action(action: &str) -> Option<(&'static str, &'static str)> {
        match action {
            "delete_volume" => Some(("DeleteVolume", "VolumeId")),
            "delete_snapshot" => Some(("DeleteSnapshot", "SnapshotId")),
            "release_ip" => Some(("ReleaseAddress", "AllocationId")),
            "stop_instance" => Some(("StopInstances", "InstanceId.1")),
            "delete_nat_gateway" => Some(("DeleteNatGateway", "NatGatewayId")),
            _ => None,
        }
    }
}

#[async_trait]
impl ProviderApi for AwsApi {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    async fn list_resources(&self, kind: ResourceKind) -> Result<Vec<CloudResource>> {
        let Some(resource_type) = Self::config_resource_type(kind) else {
            return Ok(Vec::new());
        };
        let expression = format!(
            "SELECT resourceId, resourceName, configuration, resourceCreationTime, awsRegion, tags \
             WHERE resourceType = '{resource_type}'"
        );
        let rows = self.select_config(&expression).await?;
        Ok(rows.iter().map(Self::parse_resource).collect())
    }

    async fn metric_sum(
        &self,
        resource_id: &str,
        metric: &str,
        lookback_days: u32,
    ) -> Result<f64> {
        // Metric spec: "{namespace}:{metric_name}:{dimension_name}".
        let mut parts = metric.splitn(3, ':');
        let namespace = parts.next().unwrap_or("AWS/EC2");
        let metric_name = parts.next().unwrap_or(metric);
        let dimension = parts.next().unwrap_or("InstanceId");

        let end = Utc::now();
        let start = end - chrono::Duration::days(lookback_days as i64);
        let period = (lookback_days as i64 * 86_400).max(60);

        let body = json!({
            "StartTime": start.timestamp(),
            "EndTime": end.timestamp(),
            "MetricDataQueries": [{
                "Id": "m1",
                "MetricStat": {
                    "Metric": {
                        "Namespace": namespace,
                        "MetricName": metric_name,
                        "Dimensions": [{ "Name": dimension, "Value": resource_id }]
                    },
                    "Period": period,
                    "Stat": "Sum"
                }
            }]
        });

        let response = self
            .json_call(
                "monitoring",
                &self.region,
                "GraniteServiceVersion20100801.GetMetricData",
                "application/x-amz-json-1.0",
                &body,
            )
            .await?;

        let total = response["MetricDataResults"]
            .as_array()
            .into_iter()
            .flatten()
            .flat_map(|r| r["Values"].as_array().into_iter().flatten())
            .filter_map(Value::as_f64)
            .sum();
        Ok(total)
    }

    async fn execute_action(&self, action: &str, resource_id: &str) -> Result<()> {
        let (ec2_action, param) = Self::ec2_action(action)
            .with_context(|| format!("unsupported aws action: {action}"))?;

        let host = format!("ec2.{}.amazonaws.com", self.region);
        let body = format!("Action={ec2_action}&Version=2016-11-15&{param}={resource_id}");
        let content_type = "application/x-www-form-urlencoded; charset=utf-8";
        let signed = sign_post(
            &self.credentials,
            &self.region,
            "ec2",
            &host,
            content_type,
            body.as_bytes(),
            Utc::now(),
        );

        let mut request = self
            .http
            .post(format!("https://{host}/"))
            .timeout(API_TIMEOUT)
            .header("content-type", content_type)
            .body(body);
        for (name, value) in signed {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("aws ec2 {ec2_action} returned {status}: {text}"));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudAdapter for AwsApi {
    async fn stream_cost_and_usage(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<BoxStream<'static, Result<UsageRecord>>> {
        let api = self.clone();
        let start_str = start.format("%Y-%m-%d").to_string();
        let end_str = end.format("%Y-%m-%d").to_string();
        let granularity = granularity.as_str().to_string();

        // Page through Cost Explorer lazily; each page yields its records
        // before the next page is requested.
        let pages = stream::try_unfold(
            (api, Some(String::new())),
            move |(api, token)| {
                let start_str = start_str.clone();
                let end_str = end_str.clone();
                let granularity = granularity.clone();
                async move {
                    let Some(token) = token else {
                        return Ok::<_, anyhow::Error>(None);
                    };

                    let mut body = json!({
                        "TimePeriod": { "Start": start_str, "End": end_str },
                        "Granularity": granularity,
                        "Metrics": ["UnblendedCost"],
                        "GroupBy": [{ "Type": "DIMENSION", "Key": "SERVICE" }]
                    });
                    if !token.is_empty() {
                        body["NextPageToken"] = json!(token);
                    }

                    let response = api
                        .json_call(
                            "ce",
                            "us-east-1",
                            "AWSInsightsIndexService.GetCostAndUsage",
                            "application/x-amz-json-1.1",
                            &body,
                        )
                        .await?;

                    let records = parse_cost_page(&response);
                    let next = response["NextPageToken"].as_str().map(str::to_string);
                    Ok(Some((records, (api, next))))
                }
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

fn parse_cost_page(response: &Value) -> Vec<UsageRecord> {
    let mut records = Vec::new();
    for window in response["ResultsByTime"].as_array().into_iter().flatten() {
        let occurred_at = window["TimePeriod"]["Start"]
            .as_str()
            .and_then(parse_cost_timestamp)
            .unwrap_or_else(Utc::now);

        for group in window["Groups"].as_array().into_iter().flatten() {
            let service = group["Keys"][0].as_str().unwrap_or("unknown").to_string();
            let amount = group["Metrics"]["UnblendedCost"]["Amount"]
                .as_str()
                .and_then(|a| Decimal::from_str(a).ok())
                .unwrap_or_default();
            let unit = group["Metrics"]["UnblendedCost"]["Unit"]
                .as_str()
                .map(str::to_string);

            records.push(UsageRecord {
                occurred_at,
                service,
                resource_id: None,
                region: None,
                cost_usd: amount,
                usage_amount: None,
                usage_unit: unit,
            });
        }
    }
    records
}

/// Cost Explorer emits `2026-01-15` for daily and
/// `2026-01-15T00:00:00Z` for hourly windows.
fn parse_cost_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_mapping_covers_aws_kinds_only() {
        assert_eq!(
            AwsApi::config_resource_type(ResourceKind::Volume),
            Some("AWS::EC2::Volume")
        );
        assert_eq!(AwsApi::config_resource_type(ResourceKind::Disk), None);
        assert_eq!(AwsApi::config_resource_type(ResourceKind::PublicIp), None);
    }

    #[test]
    fn ec2_action_mapping_is_closed() {
        assert_eq!(
            AwsApi::ec2_action("delete_volume"),
            Some(("DeleteVolume", "VolumeId"))
        );
        assert_eq!(AwsApi::ec2_action("format_everything"), None);
    }

    #[test]
    fn parse_resource_reads_volume_shape() {
        let row = json!({
            "resourceId": "vol-0abc",
            "resourceName": "data",
            "awsRegion": "us-east-1",
            "resourceCreationTime": "2025-11-02T10:00:00Z",
            "configuration": { "state": { "value": "available" }, "size": 200, "attachments": [] },
            "tags": [{ "key": "Owner", "value": "data-eng" }]
        });
        let resource = AwsApi::parse_resource(&row);
        assert_eq!(resource.id, "vol-0abc");
        assert_eq!(resource.state.as_deref(), Some("available"));
        assert_eq!(resource.size_gb, Some(200.0));
        assert_eq!(resource.attachments, Some(0));
        assert_eq!(resource.owner_tag(), Some("data-eng"));
    }

    #[test]
    fn cost_page_parses_groups() {
        let page = json!({
            "ResultsByTime": [{
                "TimePeriod": { "Start": "2026-01-14", "End": "2026-01-15" },
                "Groups": [{
                    "Keys": ["Amazon Elastic Compute Cloud - Compute"],
                    "Metrics": { "UnblendedCost": { "Amount": "12.3456", "Unit": "USD" } }
                }]
            }]
        });
        let records = parse_cost_page(&page);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cost_usd, Decimal::from_str("12.3456").unwrap());
        assert_eq!(records[0].service, "Amazon Elastic Compute Cloud - Compute");
    }

    #[test]
    fn cost_timestamp_accepts_both_shapes() {
        assert!(parse_cost_timestamp("2026-01-15").is_some());
        assert!(parse_cost_timestamp("2026-01-15T03:00:00Z").is_some());
        assert!(parse_cost_timestamp("nope").is_none());
    }
}
