//! The Worker (spec §4.4): processes one leased task end to end — fetch,
//! auth-redirect detection, plugin normalization, asset versioning, outbound
//! link discovery through the Frontier Filter, and the terminal Queue
//! transition. One `Worker` handles one task at a time; the Executor owns
//! how many run concurrently.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sitesync_core::canonical;
use sitesync_core::fetch::{FetchOutcome, FetchProfile, Fetcher, PermanentFetchError, TransientFetchError};
use sitesync_core::model::{ExceptionKind, Task};
use sitesync_core::plugin::{NormalizationError, Plugin, PluginRegistry};
use sitesync_frontier::{CompiledProfile, DenySignal, FilterOutcome, RuntimeDenyRules};
use sitesync_queue::{BackpressureGate, Queue, QueueError};
use sitesync_store::Store;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub lease_ttl_secs: i64,
    pub fetch_timeout: Duration,
    /// Path prefixes treated as an auth redirect for the link-discovery
    /// suppression rule (spec §4.4 step 4).
    pub auth_redirect_prefixes: Vec<String>,
}

pub struct Worker {
    queue: Queue,
    store: Store,
    fetcher: Arc<dyn Fetcher>,
    plugins: Arc<PluginRegistry>,
    profile: Arc<CompiledProfile>,
    runtime_deny: Arc<RuntimeDenyRules>,
    deny_signal_tx: mpsc::UnboundedSender<DenySignal>,
    backpressure: Arc<BackpressureGate>,
    fetch_profile: FetchProfile,
    config: WorkerConfig,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Queue,
        store: Store,
        fetcher: Arc<dyn Fetcher>,
        plugins: Arc<PluginRegistry>,
        profile: Arc<CompiledProfile>,
        runtime_deny: Arc<RuntimeDenyRules>,
        deny_signal_tx: mpsc::UnboundedSender<DenySignal>,
        backpressure: Arc<BackpressureGate>,
        fetch_profile: FetchProfile,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            fetcher,
            plugins,
            profile,
            runtime_deny,
            deny_signal_tx,
            backpressure,
            fetch_profile,
            config,
        }
    }

    /// Runs the per-task lifecycle (spec §4.4 steps 1-8). Returns once the
    /// task has reached a terminal Store state or has been released back to
    /// `pending` on cancellation or lost lease. Errors surfaced here are
    /// infrastructure failures (store unavailable) that the Executor should
    /// treat as run-fatal.
    pub async fn process_task(&self, task: Task, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        if *cancel.borrow() {
            self.queue.release(task.id, Utc::now()).await?;
            return Ok(());
        }

        let lease_lost = Arc::new(AtomicBool::new(false));
        let renewal = self.spawn_lease_renewal(task.id, lease_lost.clone(), cancel.clone());

        let result = self.run_pipeline(&task, &lease_lost, &mut cancel).await;
        renewal.abort();
        result
    }

    fn spawn_lease_renewal(
        &self,
        task_id: Uuid,
        lease_lost: Arc<AtomicBool>,
        mut cancel: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let interval = Duration::from_secs((self.config.lease_ttl_secs / 3).max(1) as u64);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            return;
                        }
                        continue;
                    }
                }

                match queue.renew(task_id, Utc::now()).await {
                    Ok(()) => {}
                    Err(QueueError::LeaseLost) => {
                        lease_lost.store(true, Ordering::SeqCst);
                        tracing::warn!(
                            event = "sitesync.worker.lease_lost",
                            task_id = %task_id,
                            "lease lost during renewal"
                        );
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(
                            event = "sitesync.worker.renew_error",
                            task_id = %task_id,
                            error = %err,
                            "lease renewal attempt failed; will retry"
                        );
                    }
                }
            }
        })
    }

    async fn run_pipeline(
        &self,
        task: &Task,
        lease_lost: &AtomicBool,
        cancel: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let fetch_outcome = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.fetcher.fetch(&task.url, &self.fetch_profile),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => FetchOutcome::Transient(TransientFetchError("fetch timeout".to_string())),
        };

        if self.abort_if_lost_or_cancelled(task.id, lease_lost, cancel).await? {
            return Ok(());
        }

        let fetch_result = match fetch_outcome {
            FetchOutcome::Ok(result) => result,
            FetchOutcome::Transient(TransientFetchError(msg)) => {
                self.queue.fail_transient(task.id, &msg, Utc::now()).await?;
                return Ok(());
            }
            FetchOutcome::Permanent(PermanentFetchError(msg)) => {
                self.record_permanent_failure(task, &msg, ExceptionKind::PermanentFetch).await?;
                return Ok(());
            }
        };

        let auth_redirect = self.detect_auth_redirect(&fetch_result.final_url);

        let Some(plugin) = self.plugins.select(task.plugin_hint.as_deref(), &fetch_result) else {
            self.record_permanent_failure(task, "no plugin matched fetch result", ExceptionKind::Normalization)
                .await?;
            return Ok(());
        };

        let record = match plugin.normalize(&fetch_result) {
            Ok(record) => record,
            Err(NormalizationError(msg)) => {
                self.record_permanent_failure(task, &msg, ExceptionKind::Normalization).await?;
                return Ok(());
            }
        };

        if self.abort_if_lost_or_cancelled(task.id, lease_lost, cancel).await? {
            return Ok(());
        }

        let normalized_hash = hex_sha256(&record.normalized_payload);
        let raw_hash = hex_sha256(&fetch_result.body);

        let upsert = self
            .store
            .upsert_asset_version(
                task.run_id,
                &task.source_name,
                &record.canonical_url,
                &record.asset_type,
                &normalized_hash,
                &raw_hash,
                &record.raw_payload_ref,
                Utc::now(),
            )
            .await?;

        tracing::info!(
            event = "sitesync.worker.asset_versioned",
            task_id = %task.id,
            asset_id = %upsert.asset_id,
            diff_class = upsert.diff_class.as_str(),
            "asset version recorded"
        );

        if let Some((prefix, continue_path)) = auth_redirect {
            self.suppress_links_after_auth_redirect(task, &fetch_result.final_url, &prefix, &continue_path);
        } else {
            self.discover_links(task, &record.relationships, cancel).await?;
        }

        if self.abort_if_lost_or_cancelled(task.id, lease_lost, cancel).await? {
            return Ok(());
        }

        self.queue.finish(task.id, Utc::now()).await?;
        Ok(())
    }

    /// Returns `true` if the task should stop processing without reaching a
    /// terminal store write: the lease was lost (another worker may already
    /// own it) or cancellation was requested (release instead of complete).
    async fn abort_if_lost_or_cancelled(
        &self,
        task_id: Uuid,
        lease_lost: &AtomicBool,
        cancel: &watch::Receiver<bool>,
    ) -> anyhow::Result<bool> {
        if lease_lost.load(Ordering::SeqCst) {
            tracing::warn!(
                event = "sitesync.worker.abort_lease_lost",
                task_id = %task_id,
                "aborting task after lease lost"
            );
            return Ok(true);
        }
        if *cancel.borrow() {
            self.queue.release(task_id, Utc::now()).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn record_permanent_failure(
        &self,
        task: &Task,
        message: &str,
        kind: ExceptionKind,
    ) -> anyhow::Result<()> {
        self.store
            .insert_exception(task.run_id, Some(task.id), &task.url, kind, message, &serde_json::Value::Null, Utc::now())
            .await?;
        self.queue.fail_permanent(task.id, message, Utc::now()).await?;
        Ok(())
    }

    /// spec §4.4 step 4: terminal URL under a configured auth prefix with a
    /// `continue=<path>` query parameter.
    fn detect_auth_redirect(&self, final_url: &str) -> Option<(String, String)> {
        let parsed = url::Url::parse(final_url).ok()?;
        let path = parsed.path();
        let prefix = self
            .config
            .auth_redirect_prefixes
            .iter()
            .find(|p| path.starts_with(p.as_str()))?;
        let continue_path = parsed
            .query_pairs()
            .find(|(k, _)| k == "continue")
            .map(|(_, v)| v.into_owned())?;
        Some((prefix.clone(), continue_path))
    }

    fn suppress_links_after_auth_redirect(&self, task: &Task, final_url: &str, prefix: &str, continue_path: &str) {
        if let Some(host) = canonical::host_of(final_url) {
            let _ = self.deny_signal_tx.send(DenySignal {
                domain: host.clone(),
                pattern: format!("{prefix}/**"),
            });
            let _ = self.deny_signal_tx.send(DenySignal {
                domain: host,
                pattern: format!("{continue_path}/**"),
            });
        }
        tracing::info!(
            event = "sitesync.worker.auth_redirect_suppressed",
            task_id = %task.id,
            prefix,
            continue_path,
            "suppressed link discovery after auth redirect"
        );
    }

    /// spec §4.4 step 7: every survivor is enqueued "only after the
    /// backpressure gate permits." One gate check covers the whole page's
    /// links rather than one per link — the ceiling only needs to hold
    /// approximately (spec §5: in-flight counters may be eventually
    /// consistent).
    async fn discover_links(
        &self,
        task: &Task,
        relationships: &[String],
        cancel: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if relationships.is_empty() {
            return Ok(());
        }

        if !self.backpressure.wait(cancel).await? {
            return Ok(());
        }

        for link in relationships {
            let Some(canon) = canonical::canonicalize(link, Some(&task.url)) else {
                continue;
            };

            match sitesync_frontier::evaluate(&canon, task.depth + 1, &self.profile, &self.runtime_deny) {
                FilterOutcome::Enqueue => {
                    match self
                        .queue
                        .enqueue(&canon, task.depth + 1, &task.source_name, None, Utc::now())
                        .await
                    {
                        Ok(_) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                FilterOutcome::Drop(_) => {}
            }
        }
        Ok(())
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
