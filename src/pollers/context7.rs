//! Context7 quota poller — reads rate-limit headers off a minimal
//! probe request.
//!
//! The provider has no monetary cost, only quota consumption, so the
//! used request count is reported through the tokens metric with a
//! zero cost.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use super::{PollResult, ProviderPoll, UsageSample};

/// Minimal search query whose response carries the quota headers.
const PROBE_URL: &str = "https://context7.com/api/v2/libs/search?libraryName=react&query=check";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Header defaults when the probe response omits them.
const DEFAULT_LIMIT: u64 = 1000;

pub struct Context7Poller {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl Context7Poller {
    pub fn new() -> Self {
        // Env var first, then the dashboard's shared secrets file.
        let api_key = std::env::var("CONTEXT7_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| {
                let path = dirs::home_dir()?.join(".openclaw/workspace/.secrets/tokens.json");
                read_key_file(&path)
            });
        if api_key.is_none() {
            warn!("[Context7] no API key in environment or secrets file — poller disabled");
        }
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl ProviderPoll for Context7Poller {
    fn provider(&self) -> &str {
        "Context7"
    }

    fn enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn poll(&self) -> Result<PollResult> {
        let Some(key) = self.api_key.as_deref() else {
            return Ok(PollResult::Empty);
        };

        let resp = self
            .client
            .get(PROBE_URL)
            .bearer_auth(key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("probe request failed")?;

        let headers = resp.headers();
        let get = |name: &str| -> Option<u64> { headers.get(name)?.to_str().ok()?.parse().ok() };

        let limit = get("ratelimit-limit").unwrap_or(DEFAULT_LIMIT);
        let remaining = get("ratelimit-remaining").unwrap_or(0);
        let reset = headers
            .get("ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("0")
            .to_string();

        let used = limit.saturating_sub(remaining);

        let mut meta = Map::new();
        meta.insert("metric".to_string(), Value::from("requests"));
        meta.insert("limit".to_string(), Value::from(limit));
        meta.insert("remaining".to_string(), Value::from(remaining));
        meta.insert("reset_ts".to_string(), Value::from(reset));

        Ok(PollResult::Usage(UsageSample {
            cost_usd: 0.0,
            tokens: used,
            meta,
        }))
    }
}

/// Read the key from the secrets file, once at construction. Any read
/// or parse problem just leaves the poller disabled.
fn read_key_file(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let tokens: Value = serde_json::from_str(&content).ok()?;
    tokens
        .get("context7_api_key")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        std::fs::write(&path, r#"{"context7_api_key": "ctx7-abc"}"#).unwrap();
        assert_eq!(read_key_file(&path).as_deref(), Some("ctx7-abc"));
    }

    #[test]
    fn test_read_key_file_tolerates_missing_or_bad_content() {
        let dir = tempfile::tempdir().unwrap();

        // Missing file
        assert!(read_key_file(&dir.path().join("absent.json")).is_none());

        // Not JSON
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "not json").unwrap();
        assert!(read_key_file(&bad).is_none());

        // JSON without the key
        let other = dir.path().join("other.json");
        std::fs::write(&other, r#"{"something_else": true}"#).unwrap();
        assert!(read_key_file(&other).is_none());
    }
}
