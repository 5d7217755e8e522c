//! Notification sink: severity-colored alerts to Slack.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info};

use crate::config::Config;

/// Alert severity, mapped to attachment colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn parse(value: &str) -> Severity {
        match value {
            "info" => Severity::Info,
            "critical" => Severity::Critical,
            _ => Severity::Warning,
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Severity::Info => "#10b981",
            Severity::Warning => "#f59e0b",
            Severity::Critical => "#f43f5e",
        }
    }
}

/// Outbound alert capability. Returns whether the message was delivered.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_alert(&self, title: &str, message: &str, severity: Severity) -> Result<bool>;
}

/// Slack `chat.postMessage` sink.
pub struct SlackSink {
    http: reqwest::Client,
    bot_token: String,
    channel_id: String,
}

impl SlackSink {
    pub fn new(bot_token: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token: bot_token.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Sink is optional: unset tokens mean "not configured" and handlers
    /// report skipped instead of failing.
    pub fn from_config(config: &Config) -> Option<Arc<dyn NotificationSink>> {
        match (&config.slack_bot_token, &config.slack_channel_id) {
            (Some(token), Some(channel)) => {
                Some(Arc::new(SlackSink::new(token.clone(), channel.clone())))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl NotificationSink for SlackSink {
    async fn send_alert(&self, title: &str, message: &str, severity: Severity) -> Result<bool> {
        let body = json!({
            "channel": self.channel_id,
            "attachments": [{
                "color": severity.color(),
                "blocks": [
                    {
                        "type": "header",
                        "text": { "type": "plain_text", "text": format!("🚨 {title}") }
                    },
                    {
                        "type": "section",
                        "text": { "type": "mrkdwn", "text": message }
                    }
                ]
            }]
        });

        let response: serde_json::Value = self
            .http
            .post("https://slack.com/api/chat.postMessage")
            .timeout(Duration::from_secs(10))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if response["ok"].as_bool().unwrap_or(false) {
            info!(title, "slack_alert_sent");
            Ok(true)
        } else {
            error!(
                error = response["error"].as_str().unwrap_or("unknown"),
                "slack_api_error"
            );
            Ok(false)
        }
    }
}
