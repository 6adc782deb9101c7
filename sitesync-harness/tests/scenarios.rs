//! Boundary scenarios from spec.md §8, driven end to end through the
//! Orchestrator with [`ScriptedFetcher`] standing in for the network. Each
//! test seeds one source, runs it to completion, and asserts on the Store's
//! final state the way `harness/tests/invariants.rs` asserts on sinks.

use sitesync_core::model::RunStatus;
use sitesync_core::plugin::Plugin;
use sitesync_frontier::{DomainRules, SourceProfile};
use sitesync_harness::{init_tracing, EchoPlugin, ScriptedFetcher, ScriptedOutcome};
use sitesync_orchestrator::config::CrawlerConfig;
use sitesync_orchestrator::Orchestrator;
use sitesync_store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn fast_config() -> CrawlerConfig {
    CrawlerConfig {
        parallel_agents: 2,
        pages_per_agent: 4,
        max_retries: 2,
        fetch_timeout_seconds: 5,
        lease_ttl_seconds: 5,
        max_in_flight: None,
        backoff_base_seconds: 0,
        backoff_cap_seconds: 0,
        jitter_fraction: 0.0,
        auth_redirect_prefixes: vec!["/auth".to_string()],
        drain_poll_millis: 20,
        storage_path: ":memory:".to_string(),
    }
}

fn example_com_profile(max_depth: i64) -> SourceProfile {
    let mut allowed_domains = HashMap::new();
    allowed_domains.insert("example.com".to_string(), DomainRules::default());
    SourceProfile { max_depth, allowed_domains }
}

async fn run_orchestrator(
    store: &Store,
    source_name: &str,
    start_urls: Vec<String>,
    profile: SourceProfile,
    config: CrawlerConfig,
    fetcher: Arc<ScriptedFetcher>,
) -> sitesync_executor::RunSummary {
    let orchestrator = Orchestrator::new(
        store.clone(),
        config,
        source_name.to_string(),
        start_urls,
        profile,
        fetcher,
        vec![Box::new(EchoPlugin) as Box<dyn Plugin>],
        Vec::new(),
    );

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    tokio::time::timeout(Duration::from_secs(10), orchestrator.run(cancel_rx))
        .await
        .expect("orchestrator run timed out")
        .expect("orchestrator run failed")
}

/// Scenario 1: a task that fails transiently on every attempt exhausts
/// `max_retries` and lands in `error`, while the run itself still completes.
#[tokio::test]
async fn retry_exhaustion_lands_task_in_error_but_completes_the_run() {
    init_tracing();
    let store = Store::in_memory().await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new());
    let url = "https://example.com/flaky";

    // max_retries = 2: attempts 1 and 2 reschedule, attempt 3 is terminal.
    fetcher.script(url, ScriptedOutcome::Transient("boom".to_string()));
    fetcher.script(url, ScriptedOutcome::Transient("boom".to_string()));
    fetcher.script(url, ScriptedOutcome::Transient("boom".to_string()));

    let summary = run_orchestrator(
        &store,
        "flaky-source",
        vec![url.to_string()],
        example_com_profile(5),
        fast_config(),
        fetcher.clone(),
    )
    .await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counts.error, 1);
    assert_eq!(summary.counts.pending, 0);
    assert_eq!(summary.counts.in_progress, 0);
    assert_eq!(fetcher.call_count(url), 3);

    let tasks = store.task_counts(summary.run_id).await.unwrap();
    assert_eq!(tasks.error, 1);
}

/// Scenario 2: one transient failure followed by success leaves the task
/// `finished` with exactly one `AssetVersion` recorded as `new`.
#[tokio::test]
async fn recovers_after_one_transient_failure() {
    init_tracing();
    let store = Store::in_memory().await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new());
    let url = "https://example.com/recovers";

    fetcher.script(url, ScriptedOutcome::Transient("hiccup".to_string()));
    fetcher.script(
        url,
        ScriptedOutcome::Html {
            final_url: url.to_string(),
            body: "hello world".to_string(),
            links: vec![],
        },
    );

    let summary = run_orchestrator(
        &store,
        "recovers-source",
        vec![url.to_string()],
        example_com_profile(5),
        fast_config(),
        fetcher.clone(),
    )
    .await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counts.finished, 1);
    assert_eq!(summary.counts.error, 0);
    assert_eq!(fetcher.call_count(url), 2);

    let asset = store.get_asset("recovers-source", url).await.unwrap().expect("asset recorded");
    let versions = store.list_asset_versions(asset.id).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].diff_class, sitesync_core::model::DiffClass::New);
}

/// Scenario 5: landing on a final URL under an auth prefix with a
/// `continue=` parameter suppresses that page's outbound links and adds
/// runtime deny rules so the auth path itself is never (re-)enqueued.
#[tokio::test]
async fn auth_redirect_suppresses_link_discovery() {
    init_tracing();
    let store = Store::in_memory().await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new());
    let start = "https://example.com/start";

    fetcher.script(
        start,
        ScriptedOutcome::Html {
            final_url: "https://example.com/auth/login?continue=/dashboard".to_string(),
            body: "please log in".to_string(),
            links: vec![
                "https://example.com/dashboard".to_string(),
                "https://example.com/other".to_string(),
            ],
        },
    );

    let summary = run_orchestrator(
        &store,
        "auth-source",
        vec![start.to_string()],
        example_com_profile(5),
        fast_config(),
        fetcher.clone(),
    )
    .await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counts.finished, 1);
    assert_eq!(summary.counts.pending, 0);
    assert_eq!(summary.counts.in_progress, 0);

    // Neither the dashboard nor any other page was ever fetched: the only
    // call recorded is the initial one to `start`.
    assert_eq!(fetcher.call_count("https://example.com/dashboard"), 0);
    assert_eq!(fetcher.call_count("https://example.com/other"), 0);

    assert_eq!(summary.suggested_deny_rules.len(), 2);
}

/// Scenario 6: a cooperative stop mid-run releases in-flight tasks back to
/// `pending` without touching their attempt counts, and the run is recorded
/// as `stopped` with `completed_at` set.
#[tokio::test]
async fn user_stop_releases_in_flight_tasks_without_penalty() {
    init_tracing();
    let store = Store::in_memory().await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new());
    let url = "https://example.com/slow";

    // Slow enough that the task is still leased and in flight when the test
    // sends the stop signal below.
    fetcher.set_delay(Duration::from_millis(300));
    fetcher.script(
        url,
        ScriptedOutcome::Html {
            final_url: url.to_string(),
            body: "eventually arrives".to_string(),
            links: vec![],
        },
    );

    let orchestrator = Orchestrator::new(
        store.clone(),
        fast_config(),
        "stop-source".to_string(),
        vec![url.to_string()],
        example_com_profile(5),
        fetcher.clone(),
        vec![Box::new(EchoPlugin) as Box<dyn Plugin>],
        Vec::new(),
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { orchestrator.run(cancel_rx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel_tx.send(true).unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("stop did not complete in time")
        .expect("task panicked")
        .expect("orchestrator run failed");

    assert_eq!(summary.status, RunStatus::Stopped);

    let run = store.get_run(summary.run_id).await.unwrap().expect("run recorded");
    assert_eq!(run.status, RunStatus::Stopped);
    assert!(run.completed_at.is_some());

    // Released back to pending, not retried: `release` (unlike
    // `fail_transient`) never increments `attempt_count` (spec I5).
    let tasks = store.task_counts(summary.run_id).await.unwrap();
    assert_eq!(tasks.in_progress, 0);
    assert_eq!(tasks.pending, 1);
    assert_eq!(tasks.finished, 0);
    assert_eq!(tasks.error, 0);
}
