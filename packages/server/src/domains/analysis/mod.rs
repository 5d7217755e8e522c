//! LLM-backed analysis collaborator.
//!
//! The analytic content is uninteresting here; what matters is the seam: a
//! trait the finops and zombie-analysis handlers call, with a thin
//! chat-completions client behind it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::Config;

/// Analysis capability over a normalized usage or scan summary.
#[async_trait]
pub trait UsageAnalyzer: Send + Sync {
    async fn analyze(&self, summary: &Value, tenant_id: Uuid) -> Result<String>;
}

/// OpenAI-compatible chat-completions client.
pub struct LlmAnalyzer {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl LlmAnalyzer {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn from_config(config: &Config) -> Option<Arc<dyn UsageAnalyzer>> {
        match (&config.llm_api_url, &config.llm_api_key) {
            (Some(url), Some(key)) => Some(Arc::new(LlmAnalyzer::new(url.clone(), key.clone()))),
            _ => None,
        }
    }
}

#[async_trait]
impl UsageAnalyzer for LlmAnalyzer {
    async fn analyze(&self, summary: &Value, tenant_id: Uuid) -> Result<String> {
        let body = json!({
            "model": "gpt-4o-mini",
            "messages": [
                {
                    "role": "system",
                    "content": "You are a FinOps analyst. Given cloud usage or waste data, \
                                produce a short, actionable cost review."
                },
                {
                    "role": "user",
                    "content": format!("Tenant {tenant_id} data:\n{summary}")
                }
            ],
            "temperature": 0.2
        });

        let response: Value = self
            .http
            .post(format!("{}/chat/completions", self.api_url.trim_end_matches('/')))
            .timeout(Duration::from_secs(120))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("analyzer response carried no content"))
    }
}
