//! The Orchestrator (spec §4.6): thin glue between the CLI layer and the
//! Executor. Resolves config, creates or resumes a `Run`, seeds the
//! frontier, builds the plugin registry, runs the Executor to completion,
//! and reconciles assets that went missing this run.

pub mod config;

use chrono::Utc;
use config::CrawlerConfig;
use sitesync_core::fetch::Fetcher;
use sitesync_core::plugin::{Plugin, PluginFactory, PluginRegistry};
use sitesync_executor::{Executor, ExecutorConfig, RunSummary};
use sitesync_frontier::{CompiledProfile, RuntimeDenyRules, SourceProfile};
use sitesync_store::{Store, StoreError};
use sitesync_worker::WorkerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

pub struct Orchestrator {
    store: Store,
    config: CrawlerConfig,
    source_name: String,
    start_urls: Vec<String>,
    profile: SourceProfile,
    fetcher: Arc<dyn Fetcher>,
    plugins: Arc<PluginRegistry>,
}

impl Orchestrator {
    /// Builds the plugin registry per spec §6 ("Built-in plugins must be
    /// registered before any discovered ones") and binds everything else the
    /// Executor needs. `builtins` is registered first; `discovered` is
    /// loaded via [`sitesync_core::plugin::load_discovered`], which tolerates
    /// individual factory failures.
    pub fn new(
        store: Store,
        config: CrawlerConfig,
        source_name: String,
        start_urls: Vec<String>,
        profile: SourceProfile,
        fetcher: Arc<dyn Fetcher>,
        builtins: Vec<Box<dyn Plugin>>,
        discovered: Vec<Box<dyn PluginFactory>>,
    ) -> Self {
        let mut registry = PluginRegistry::new();
        for plugin in builtins {
            registry.register(plugin);
        }
        registry.set_last_as_default();
        sitesync_core::plugin::load_discovered(&mut registry, &discovered);

        Self {
            store,
            config,
            source_name,
            start_urls,
            profile,
            fetcher,
            plugins: Arc::new(registry),
        }
    }

    /// Runs one crawl to completion: creates or resumes the `Run`, seeds the
    /// frontier, starts the Executor, awaits it, then reconciles missing
    /// assets (SPEC_FULL.md §11). `cancel_rx` is the CLI's double-ESC signal.
    pub async fn run(&self, cancel_rx: watch::Receiver<bool>) -> anyhow::Result<RunSummary> {
        let compiled_profile = Arc::new(CompiledProfile::compile(&self.profile)?);
        let runtime_deny = Arc::new(RuntimeDenyRules::new());

        let config_snapshot = serde_json::to_value(&SnapshotView {
            crawler: &self.config,
            source_name: &self.source_name,
            start_urls: &self.start_urls,
        })?;

        let run = match self.store.find_resumable_run(&self.source_name).await? {
            Some(run) => {
                // A `stopped` run was finalized on the prior attempt; reopen
                // it to `running` so this attempt's `finalize_run` (which
                // only matches `status='running'`) finalizes it again
                // instead of silently matching zero rows.
                self.store.reopen_run(run.id).await?;
                tracing::info!(
                    event = "sitesync.orchestrator.run.resumed",
                    run_id = %run.id,
                    source_name = %self.source_name,
                    "resuming existing run"
                );
                run
            }
            None => {
                let run = self
                    .store
                    .create_run(&self.source_name, Utc::now(), &config_snapshot)
                    .await?;
                tracing::info!(
                    event = "sitesync.orchestrator.run.started",
                    run_id = %run.id,
                    source_name = %self.source_name,
                    "started new run"
                );
                run
            }
        };

        self.seed_frontier(run.id).await?;

        let fetch_profile = sitesync_core::fetch::FetchProfile {
            source_name: self.source_name.clone(),
            user_agent: None,
        };

        let executor = Executor::new(
            self.store.clone(),
            run.id,
            self.source_name.clone(),
            self.fetcher.clone(),
            self.plugins.clone(),
            compiled_profile,
            runtime_deny,
            fetch_profile,
            self.config.backoff(),
            ExecutorConfig {
                parallel_agents: self.config.parallel_agents,
                pages_per_agent: self.config.pages_per_agent,
                max_retries: self.config.max_retries,
                lease_ttl_secs: self.config.lease_ttl_seconds,
                max_in_flight: self.config.max_in_flight(),
                drain_poll_interval: Duration::from_millis(self.config.drain_poll_millis),
                worker: WorkerConfig {
                    lease_ttl_secs: self.config.lease_ttl_seconds,
                    fetch_timeout: Duration::from_secs(self.config.fetch_timeout_seconds),
                    auth_redirect_prefixes: self.config.auth_redirect_prefixes.clone(),
                },
            },
        );

        let summary = executor.run(cancel_rx).await?;

        self.reconcile_missing_assets(run.id, run.started_at).await?;

        tracing::info!(
            event = "sitesync.orchestrator.run.finalized",
            run_id = %summary.run_id,
            status = summary.status.as_str(),
            pending = summary.counts.pending,
            finished = summary.counts.finished,
            error = summary.counts.error,
            exceptions = summary.exceptions.len(),
            "run summary ready"
        );

        Ok(summary)
    }

    /// spec §4.6 step 3: one task per start URL at depth 0, tolerating
    /// `DuplicateTask` on resume.
    async fn seed_frontier(&self, run_id: Uuid) -> anyhow::Result<()> {
        let now = Utc::now();
        for url in &self.start_urls {
            match self
                .store
                .enqueue_task(run_id, url, 0, &self.source_name, None, now)
                .await
            {
                Ok(_) => {}
                Err(StoreError::DuplicateTask) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// SPEC_FULL.md §11: assets not seen since this run began are recorded
    /// as unresolved `missing` exceptions; assets with a prior unresolved
    /// `missing` exception that were seen again are auto-resolved. Both
    /// sides check across every run for this source, not just the current
    /// one: a `missing` exception can predate this run by several resumes,
    /// and looking only at `run_id`'s own exceptions would either duplicate
    /// the exception on every subsequent run or never notice a reappearance.
    async fn reconcile_missing_assets(&self, run_id: Uuid, run_started_at: chrono::DateTime<Utc>) -> anyhow::Result<()> {
        use sitesync_core::model::ExceptionKind;

        let now = Utc::now();
        let stale = self.store.assets_not_seen_since(&self.source_name, run_started_at).await?;
        let unresolved = self.store.list_unresolved_missing_for_source(&self.source_name).await?;

        for asset in &stale {
            if !unresolved.iter().any(|e| e.url == asset.url) {
                self.store
                    .insert_exception(
                        run_id,
                        None,
                        &asset.url,
                        ExceptionKind::Missing,
                        "asset not observed during this run",
                        &serde_json::Value::Null,
                        now,
                    )
                    .await?;
            }
        }

        for exception in &unresolved {
            let reappeared = !stale.iter().any(|a| a.url == exception.url);
            if reappeared {
                self.store.resolve_exception(exception.id, now).await?;
            }
        }

        Ok(())
    }
}

#[derive(serde::Serialize)]
struct SnapshotView<'a> {
    crawler: &'a CrawlerConfig,
    source_name: &'a str,
    start_urls: &'a [String],
}
