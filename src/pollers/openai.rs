//! OpenAI cost poller — sums the per-date usage endpoint over the
//! month-to-date range.
//!
//! The usage endpoint is keyed by calendar date, so one poll issues
//! one request per day of the current month and sums the results. A
//! single bad date contributes nothing instead of aborting the whole
//! sweep.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::warn;

use super::{PollResult, ProviderPoll, UsageSample};

const BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between per-date requests to stay under rate limits.
const PER_DATE_DELAY: Duration = Duration::from_millis(100);
/// Safety bound on the date sweep in case of date-arithmetic surprises.
const MAX_DATES: usize = 31;

pub struct OpenAIPoller {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl OpenAIPoller {
    pub fn new() -> Self {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!("[OpenAI] no OPENAI_API_KEY in environment — poller disabled");
        }
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    /// Fetch total cost in USD for one date, or `None` when the date
    /// yields nothing usable. Permission problems are logged as such;
    /// every per-date failure is swallowed here.
    async fn fetch_date(&self, key: &str, date: NaiveDate) -> Option<f64> {
        let url = format!("{}/usage?date={}", BASE_URL, date.format("%Y-%m-%d"));
        let resp = match self
            .client
            .get(&url)
            .bearer_auth(key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!("[OpenAI] request for {} failed: {}", date, e);
                return None;
            }
        };

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            warn!(
                "[OpenAI] permission denied for date {} — check API key scopes",
                date
            );
            return None;
        }
        if !status.is_success() {
            warn!("[OpenAI] HTTP {} for date {}", status.as_u16(), date);
            return None;
        }

        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("[OpenAI] bad response body for {}: {}", date, e);
                return None;
            }
        };

        // total_usage is reported in cents.
        Some(body.get("total_usage").and_then(Value::as_f64).unwrap_or(0.0) / 100.0)
    }
}

#[async_trait]
impl ProviderPoll for OpenAIPoller {
    fn provider(&self) -> &str {
        "OpenAI"
    }

    fn enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn poll(&self) -> Result<PollResult> {
        let Some(key) = self.api_key.as_deref() else {
            return Ok(PollResult::Empty);
        };

        let today = Local::now().date_naive();
        let dates = month_to_date(today);
        let start_date = dates.first().copied().unwrap_or(today);

        let mut total_cost = 0.0;
        let mut breakdown = Map::new();
        for date in &dates {
            if let Some(cost) = self.fetch_date(key, *date).await {
                total_cost += cost;
                breakdown.insert(date.format("%Y-%m-%d").to_string(), Value::from(cost));
                tokio::time::sleep(PER_DATE_DELAY).await;
            }
        }

        let mut meta = Map::new();
        meta.insert("period".to_string(), Value::from("month_to_date"));
        meta.insert(
            "start_date".to_string(),
            Value::from(start_date.format("%Y-%m-%d").to_string()),
        );
        meta.insert("breakdown".to_string(), Value::Object(breakdown));

        Ok(PollResult::Usage(UsageSample {
            cost_usd: total_cost,
            tokens: 0,
            meta,
        }))
    }
}

/// Dates from the first of the month through `today` inclusive,
/// capped at the trailing `MAX_DATES` entries.
fn month_to_date(today: NaiveDate) -> Vec<NaiveDate> {
    let start = today.with_day(1).unwrap_or(today);
    let mut dates: Vec<NaiveDate> = start.iter_days().take_while(|d| *d <= today).collect();
    if dates.len() > MAX_DATES {
        dates = dates.split_off(dates.len() - MAX_DATES);
    }
    dates
}
