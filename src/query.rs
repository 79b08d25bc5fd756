//! Read-only projections over the store for the RPC surface.
//!
//! Both reads are pure: they never touch poller state or write to the
//! store, and they always come back well-formed — a store problem
//! degrades to empty fields, never to an error for the caller.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use crate::store::{HistoryPoint, METRIC_COST_USD};
use crate::AppContext;

/// Status report for one registered poller.
#[derive(Debug, Clone, Serialize)]
pub struct PollerStatus {
    pub provider: String,
    pub enabled: bool,
    pub last_run: i64,
    pub last_error: Option<String>,
    pub latest_cost_usd: Option<f64>,
    pub latest_tokens: Option<f64>,
    pub latest_meta: Option<Value>,
}

/// One status entry per registered poller, with the latest recorded
/// usage merged in.
pub fn status(ctx: &AppContext) -> Vec<PollerStatus> {
    ctx.registry
        .pollers()
        .iter()
        .map(|poller| {
            let provider = poller.provider();
            let state = poller.state();
            let latest = match ctx.store.latest(provider) {
                Ok(latest) => latest,
                Err(e) => {
                    warn!(provider, "latest lookup failed: {}", e);
                    None
                }
            };

            PollerStatus {
                provider: provider.to_string(),
                enabled: poller.enabled(),
                last_run: state.last_run,
                last_error: state.last_error,
                latest_cost_usd: latest.as_ref().map(|l| l.cost_usd),
                latest_tokens: latest.as_ref().map(|l| l.tokens_total),
                latest_meta: latest.map(|l| l.meta),
            }
        })
        .collect()
}

/// Cost history per registered provider over the trailing `days`
/// window, for charting.
pub fn history(ctx: &AppContext, days: u32) -> BTreeMap<String, Vec<HistoryPoint>> {
    let since_secs = i64::from(days) * 86_400;
    ctx.registry
        .pollers()
        .iter()
        .map(|poller| {
            let provider = poller.provider().to_string();
            let points = match ctx.store.history(&provider, METRIC_COST_USD, since_secs) {
                Ok(points) => points,
                Err(e) => {
                    warn!(provider = %provider, "history lookup failed: {}", e);
                    Vec::new()
                }
            };
            (provider, points)
        })
        .collect()
}
