//! Billing pollers — one poller per provider, one shared runner.
//!
//! Each provider implements the `ProviderPoll` trait with its own
//! protocol quirks; the `Poller` wrapper owns the bookkeeping and the
//! store writes so every variant behaves identically around its
//! `poll`. A broken provider never blocks its siblings: every failure
//! mode is reduced to a `RunOutcome` here.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::store::{UsageStore, METRIC_COST_USD, METRIC_TOKENS_TOTAL};

pub mod anthropic;
pub mod context7;
pub mod google;
pub mod openai;

// ── Core Types ──────────────────────────────────────────────────────

/// One usage snapshot fetched from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSample {
    pub cost_usd: f64,
    pub tokens: u64,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

/// What a provider's `poll` produced.
#[derive(Debug, Clone)]
pub enum PollResult {
    /// A usage snapshot to be recorded.
    Usage(UsageSample),
    /// Nothing to report — credentials absent or provider idle.
    Empty,
    /// A soft failure the provider chose to report as a value
    /// instead of an error path.
    Failed { reason: String },
}

/// Outcome of one `run`, shaped for the RPC layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success { data: UsageSample },
    Empty,
    Error { error: String },
    NotFound,
}

/// Per-provider run bookkeeping. Mutated only by that provider's own
/// `run`; an on-demand run racing a scheduled one is last-write-wins.
#[derive(Debug, Clone)]
pub struct PollerState {
    /// Epoch seconds of the last successful run, 0 for never.
    pub last_run: i64,
    pub last_error: Option<String>,
}

// ── Provider Contract ───────────────────────────────────────────────

/// The provider-specific half of a poller.
///
/// Implementations discover their credentials at construction and
/// never fail to construct — a provider without credentials registers
/// disabled. Expected absences come back as `Empty` or `Failed`
/// values; transport failures may propagate with `?`.
#[async_trait]
pub trait ProviderPoll: Send + Sync {
    /// Display name, used as the store's provider key (e.g. "OpenAI").
    fn provider(&self) -> &str;

    /// Whether credentials were discovered at construction.
    fn enabled(&self) -> bool;

    /// Fetch one usage snapshot.
    async fn poll(&self) -> Result<PollResult>;
}

// ── Shared Runner ───────────────────────────────────────────────────

/// A registered poller: provider protocol plus run bookkeeping.
pub struct Poller {
    inner: Box<dyn ProviderPoll>,
    state: Mutex<PollerState>,
}

impl Poller {
    pub fn new(inner: Box<dyn ProviderPoll>) -> Self {
        Self {
            inner,
            state: Mutex::new(PollerState {
                last_run: 0,
                last_error: None,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        self.inner.provider()
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled()
    }

    pub fn state(&self) -> PollerState {
        self.state.lock().unwrap().clone()
    }

    /// Execute one poll and record the results.
    ///
    /// The cost point is appended before the tokens point so the two
    /// stay within the store's join tolerance. A store append failure
    /// is logged and swallowed — the poll itself still succeeded, the
    /// point is simply lost for this attempt.
    pub async fn run(&self, store: &UsageStore) -> RunOutcome {
        let provider = self.provider();
        info!(provider, "starting poll");
        let start = Instant::now();

        match self.inner.poll().await {
            Ok(PollResult::Usage(mut sample)) => {
                let duration_s = (start.elapsed().as_secs_f64() * 100.0).round() / 100.0;
                sample
                    .meta
                    .insert("duration_s".to_string(), Value::from(duration_s));

                if let Err(e) =
                    store.append(provider, METRIC_COST_USD, sample.cost_usd, &sample.meta)
                {
                    error!(provider, "failed to record cost point: {}", e);
                }
                if sample.tokens > 0 {
                    if let Err(e) = store.append(
                        provider,
                        METRIC_TOKENS_TOTAL,
                        sample.tokens as f64,
                        &sample.meta,
                    ) {
                        error!(provider, "failed to record tokens point: {}", e);
                    }
                }

                {
                    let mut state = self.state.lock().unwrap();
                    state.last_run = Utc::now().timestamp();
                    state.last_error = None;
                }
                info!(
                    provider,
                    cost_usd = sample.cost_usd,
                    tokens = sample.tokens,
                    "poll success"
                );
                RunOutcome::Success { data: sample }
            }
            Ok(PollResult::Empty) => {
                warn!(provider, "poll returned no data");
                RunOutcome::Empty
            }
            Ok(PollResult::Failed { reason }) => {
                self.state.lock().unwrap().last_error = Some(reason.clone());
                error!(provider, "poll failed: {}", reason);
                RunOutcome::Error { error: reason }
            }
            Err(e) => {
                let reason = e.to_string();
                self.state.lock().unwrap().last_error = Some(reason.clone());
                error!(provider, "poll failed: {}", reason);
                RunOutcome::Error { error: reason }
            }
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Holds one poller per known provider, in registration order.
pub struct PollerRegistry {
    pollers: Vec<Arc<Poller>>,
}

impl PollerRegistry {
    /// Construct the full set of known pollers. Constructors never
    /// fail — a provider without credentials registers disabled, so
    /// one provider's misconfiguration cannot keep the rest out.
    pub fn bootstrap() -> Self {
        let registry = Self::from_pollers(vec![
            Box::new(openai::OpenAIPoller::new()),
            Box::new(anthropic::AnthropicPoller::new()),
            Box::new(google::GooglePoller::new()),
            Box::new(context7::Context7Poller::new()),
        ]);
        for poller in &registry.pollers {
            info!(
                provider = poller.provider(),
                enabled = poller.enabled(),
                "registered poller"
            );
        }
        registry
    }

    pub fn from_pollers(pollers: Vec<Box<dyn ProviderPoll>>) -> Self {
        Self {
            pollers: pollers
                .into_iter()
                .map(|p| Arc::new(Poller::new(p)))
                .collect(),
        }
    }

    pub fn pollers(&self) -> &[Arc<Poller>] {
        &self.pollers
    }

    /// Case-insensitive lookup by provider name.
    pub fn find(&self, name: &str) -> Option<Arc<Poller>> {
        self.pollers
            .iter()
            .find(|p| p.provider().eq_ignore_ascii_case(name))
            .cloned()
    }
}

// ── Test Support ────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Scripted poller for exercising the runner, scheduler and
    /// query layer without network access.
    pub struct StubPoller {
        pub name: &'static str,
        pub enabled: bool,
        pub result: StubResult,
    }

    pub enum StubResult {
        Usage { cost_usd: f64, tokens: u64 },
        Empty,
        Failed(&'static str),
        Error(&'static str),
    }

    #[async_trait]
    impl ProviderPoll for StubPoller {
        fn provider(&self) -> &str {
            self.name
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        async fn poll(&self) -> Result<PollResult> {
            match &self.result {
                StubResult::Usage { cost_usd, tokens } => Ok(PollResult::Usage(UsageSample {
                    cost_usd: *cost_usd,
                    tokens: *tokens,
                    meta: Map::new(),
                })),
                StubResult::Empty => Ok(PollResult::Empty),
                StubResult::Failed(reason) => Ok(PollResult::Failed {
                    reason: reason.to_string(),
                }),
                StubResult::Error(reason) => Err(anyhow::anyhow!(*reason)),
            }
        }
    }
}
