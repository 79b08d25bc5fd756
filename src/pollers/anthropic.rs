//! Anthropic cost poller — one usage-summary request for the
//! month-to-date window.
//!
//! Needs an organization id alongside the API key; the key alone can
//! authenticate but cannot address the usage summary. Without the org
//! id the poll reports a soft failure rather than raising.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, Local};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::warn;

use super::{PollResult, ProviderPoll, UsageSample};

const BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AnthropicPoller {
    client: reqwest::Client,
    api_key: Option<String>,
    org_id: Option<String>,
}

impl AnthropicPoller {
    pub fn new() -> Self {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!("[Anthropic] no ANTHROPIC_API_KEY in environment — poller disabled");
        }
        let org_id = std::env::var("ANTHROPIC_ORG_ID")
            .ok()
            .filter(|v| !v.is_empty());

        Self {
            client: reqwest::Client::new(),
            api_key,
            org_id,
        }
    }
}

#[async_trait]
impl ProviderPoll for AnthropicPoller {
    fn provider(&self) -> &str {
        "Anthropic"
    }

    fn enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn poll(&self) -> Result<PollResult> {
        let Some(key) = self.api_key.as_deref() else {
            return Ok(PollResult::Empty);
        };
        let Some(org_id) = self.org_id.as_deref() else {
            warn!("[Anthropic] missing ANTHROPIC_ORG_ID — cannot poll usage without it");
            return Ok(PollResult::Failed {
                reason: "missing ANTHROPIC_ORG_ID".to_string(),
            });
        };

        let today = Local::now().date_naive();
        let start_date = today
            .with_day(1)
            .unwrap_or(today)
            .format("%Y-%m-%d")
            .to_string();
        let end_date = today.format("%Y-%m-%d").to_string();

        let url = format!(
            "{}/organizations/{}/usage_summary?start_date={}&end_date={}",
            BASE_URL, org_id, start_date, end_date
        );
        let resp = self
            .client
            .get(&url)
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("usage summary request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("usage summary returned HTTP {}", status.as_u16());
        }

        let body: Value = resp
            .json()
            .await
            .context("usage summary body was not JSON")?;
        let total_cost = extract_cost(&body);

        let mut meta = Map::new();
        meta.insert("period".to_string(), Value::from("month_to_date"));
        meta.insert("start_date".to_string(), Value::from(start_date));
        meta.insert("end_date".to_string(), Value::from(end_date));

        Ok(PollResult::Usage(UsageSample {
            cost_usd: total_cost,
            tokens: 0,
            meta,
        }))
    }
}

/// Either a top-level cost field or a list of per-item costs; missing
/// fields count as zero rather than failing the poll.
fn extract_cost(body: &Value) -> f64 {
    if let Some(cost) = body.get("cost_usd").and_then(Value::as_f64) {
        return cost;
    }
    if let Some(items) = body.get("usage").and_then(Value::as_array) {
        return items
            .iter()
            .filter_map(|u| u.get("cost_usd").and_then(Value::as_f64))
            .sum();
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_cost_prefers_top_level_field() {
        let body = json!({"cost_usd": 12.34});
        assert_eq!(extract_cost(&body), 12.34);
    }

    #[test]
    fn test_extract_cost_sums_usage_items() {
        let body = json!({"usage": [
            {"cost_usd": 1.0},
            {"cost_usd": 2.5},
            {"model": "no-cost-field"},
        ]});
        assert_eq!(extract_cost(&body), 3.5);
    }

    #[test]
    fn test_extract_cost_defaults_to_zero() {
        assert_eq!(extract_cost(&json!({})), 0.0);
        assert_eq!(extract_cost(&json!({"usage": "not-a-list"})), 0.0);
    }
}
