//! Scheduled poller runs — periodic loop plus on-demand triggers.
//!
//! One background task owns the periodic loop; on-demand triggers run
//! on the calling task and funnel into the same per-poller `run`.
//! Failure containment lives inside `Poller::run`, so nothing a
//! provider does can stop the iteration.

use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::info;

use crate::pollers::RunOutcome;
use crate::AppContext;

/// Delay before the first scheduled run, giving the server a moment
/// to come up.
const STARTUP_DELAY: Duration = Duration::from_secs(5);

/// Default seconds between scheduled runs (6 hours).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 21_600;

/// Run the periodic poll loop for the lifetime of the process.
///
/// The sleep starts after a full iteration completes, so the interval
/// is iteration-to-iteration rather than start-to-start — a slow
/// provider stretches the cycle instead of overlapping it.
pub async fn run_scheduler(ctx: Arc<AppContext>, interval: Duration) {
    time::sleep(STARTUP_DELAY).await;

    loop {
        info!("📡 starting scheduled poll run");
        let ran = run_all(&ctx).await;
        info!(ran, sleep_secs = interval.as_secs(), "scheduled run complete");
        time::sleep(interval).await;
    }
}

/// One full pass over the registry, serially, enabled pollers only.
/// Returns how many pollers ran.
async fn run_all(ctx: &AppContext) -> usize {
    let mut ran = 0usize;
    for poller in ctx.registry.pollers() {
        if !poller.enabled() {
            continue;
        }
        poller.run(&ctx.store).await;
        ran += 1;
    }
    ran
}

/// Trigger one poller by name, case-insensitively.
///
/// Shares the executor with the periodic path. An overlapping run of
/// the same provider is a last-write-wins race on its state and a
/// pair of duplicate points at different timestamps — accepted, not
/// locked away.
pub async fn run_provider(ctx: &AppContext, name: &str) -> RunOutcome {
    match ctx.registry.find(name) {
        Some(poller) => {
            info!(provider = poller.provider(), "manual poll triggered");
            poller.run(&ctx.store).await
        }
        None => RunOutcome::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pollers::testing::{StubPoller, StubResult};
    use crate::pollers::PollerRegistry;
    use crate::store::{UsageStore, METRIC_COST_USD, METRIC_TOKENS_TOTAL};

    fn context(pollers: Vec<StubPoller>) -> (tempfile::TempDir, AppContext) {
        let dir = tempfile::tempdir().unwrap();
        let store = UsageStore::open(&dir.path().join("usage.db")).unwrap();
        let registry = PollerRegistry::from_pollers(
            pollers
                .into_iter()
                .map(|p| Box::new(p) as Box<dyn crate::pollers::ProviderPoll>)
                .collect(),
        );
        (dir, AppContext { store, registry })
    }

    #[tokio::test]
    async fn test_run_all_skips_disabled_pollers() {
        let (_dir, ctx) = context(vec![
            StubPoller {
                name: "A",
                enabled: false,
                result: StubResult::Usage { cost_usd: 9.9, tokens: 0 },
            },
            StubPoller {
                name: "B",
                enabled: true,
                result: StubResult::Usage { cost_usd: 3.5, tokens: 120 },
            },
        ]);

        let ran = run_all(&ctx).await;

        assert_eq!(ran, 1);
        assert!(ctx.store.history("A", METRIC_COST_USD, 3600).unwrap().is_empty());
        assert_eq!(ctx.store.history("B", METRIC_COST_USD, 3600).unwrap().len(), 1);
        assert_eq!(ctx.store.history("B", METRIC_TOKENS_TOTAL, 3600).unwrap().len(), 1);

        // Disabled poller state stays pristine.
        let a = ctx.registry.find("A").unwrap();
        assert_eq!(a.state().last_run, 0);
        assert!(a.state().last_error.is_none());
    }

    #[tokio::test]
    async fn test_run_all_continues_past_a_failing_poller() {
        let (_dir, ctx) = context(vec![
            StubPoller {
                name: "Broken",
                enabled: true,
                result: StubResult::Error("timeout"),
            },
            StubPoller {
                name: "Healthy",
                enabled: true,
                result: StubResult::Usage { cost_usd: 1.0, tokens: 0 },
            },
        ]);

        let ran = run_all(&ctx).await;

        assert_eq!(ran, 2);
        let broken = ctx.registry.find("Broken").unwrap();
        assert_eq!(broken.state().last_error.as_deref(), Some("timeout"));
        assert_eq!(broken.state().last_run, 0);
        assert!(ctx.store.history("Broken", METRIC_COST_USD, 3600).unwrap().is_empty());

        let healthy = ctx.registry.find("Healthy").unwrap();
        assert!(healthy.state().last_run > 0);
        assert_eq!(ctx.store.history("Healthy", METRIC_COST_USD, 3600).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_provider_matches_case_insensitively() {
        let (_dir, ctx) = context(vec![StubPoller {
            name: "OpenAI",
            enabled: true,
            result: StubResult::Usage { cost_usd: 0.5, tokens: 0 },
        }]);

        let outcome = run_provider(&ctx, "OPENAI").await;
        assert!(matches!(outcome, RunOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn test_run_provider_unknown_name_is_not_found() {
        let (_dir, ctx) = context(vec![]);

        let outcome = run_provider(&ctx, "nonexistent").await;
        assert!(matches!(outcome, RunOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_run_provider_works_for_disabled_poller() {
        // A manual trigger does not check enablement; the poller
        // itself answers with an empty result when it has no key.
        let (_dir, ctx) = context(vec![StubPoller {
            name: "A",
            enabled: false,
            result: StubResult::Empty,
        }]);

        let outcome = run_provider(&ctx, "a").await;
        assert!(matches!(outcome, RunOutcome::Empty));
    }
}
