//! The Executor (spec §4.5): binds a `Run` to a bounded worker pool,
//! enforces backpressure, consumes workers' runtime deny-rule requests,
//! detects drain, and finalizes the run on completion, user stop, or
//! unhandled failure.

use chrono::Utc;
use sitesync_core::backoff::Backoff;
use sitesync_core::fetch::{FetchProfile, Fetcher};
use sitesync_core::model::{Exception, RunStatus};
use sitesync_core::plugin::PluginRegistry;
use sitesync_frontier::{CompiledProfile, RuntimeDenyRules};
use sitesync_queue::{BackpressureGate, Queue, QueueConfig};
use sitesync_store::{Store, TaskCounts};
use sitesync_worker::{Worker, WorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub parallel_agents: usize,
    pub pages_per_agent: i64,
    pub max_retries: i64,
    pub lease_ttl_secs: i64,
    /// Explicit backpressure ceiling (`crawler.max_in_flight`), or
    /// `parallel_agents * pages_per_agent` when the Orchestrator leaves it
    /// unset (Open Question, decided in SPEC_FULL.md §12).
    pub max_in_flight: i64,
    pub drain_poll_interval: Duration,
    pub worker: WorkerConfig,
}

/// End-of-run summary emitted by the Orchestrator (spec §4.6 step 5,
/// SPEC_FULL.md §11).
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub counts: TaskCounts,
    pub exceptions: Vec<Exception>,
    pub suggested_deny_rules: Vec<(String, String)>,
}

pub struct Executor {
    store: Store,
    run_id: Uuid,
    source_name: String,
    fetcher: Arc<dyn Fetcher>,
    plugins: Arc<PluginRegistry>,
    profile: Arc<CompiledProfile>,
    runtime_deny: Arc<RuntimeDenyRules>,
    fetch_profile: FetchProfile,
    backoff: Backoff,
    config: ExecutorConfig,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        run_id: Uuid,
        source_name: String,
        fetcher: Arc<dyn Fetcher>,
        plugins: Arc<PluginRegistry>,
        profile: Arc<CompiledProfile>,
        runtime_deny: Arc<RuntimeDenyRules>,
        fetch_profile: FetchProfile,
        backoff: Backoff,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            run_id,
            source_name,
            fetcher,
            plugins,
            profile,
            runtime_deny,
            fetch_profile,
            backoff,
            config,
        }
    }

    /// Runs the worker pool to completion. `cancel_rx` is the CLI's
    /// cooperative-stop signal (spec §5: "double-ESC").
    pub async fn run(&self, cancel_rx: watch::Receiver<bool>) -> anyhow::Result<RunSummary> {
        match self.run_inner(cancel_rx).await {
            Ok(status) => self.finalize(status).await,
            Err(err) => {
                if let Err(finalize_err) = self.store.finalize_run(self.run_id, RunStatus::Error, Utc::now()).await {
                    tracing::error!(
                        event = "sitesync.executor.finalize_error",
                        run_id = %self.run_id,
                        error = %finalize_err,
                        "failed to finalize run after executor error"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_inner(&self, cancel_rx: watch::Receiver<bool>) -> anyhow::Result<RunStatus> {
        let (deny_tx, deny_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let deny_consumer = tokio::spawn(run_deny_consumer(self.runtime_deny.clone(), deny_rx));
        let cancel_bridge = tokio::spawn(bridge_cancel_to_stop(cancel_rx.clone(), stop_tx.clone()));

        let queue_config = QueueConfig {
            batch_size: self.config.pages_per_agent,
            lease_ttl_secs: self.config.lease_ttl_secs,
            max_retries: self.config.max_retries,
        };

        let queue = Queue::new(
            self.store.clone(),
            self.run_id,
            "executor-drain".to_string(),
            queue_config.clone(),
            self.backoff,
        );
        let backpressure = Arc::new(BackpressureGate::new(
            queue.clone(),
            self.config.max_in_flight,
            self.config.drain_poll_interval,
        ));

        let mut worker_handles = Vec::with_capacity(self.config.parallel_agents);
        for i in 0..self.config.parallel_agents {
            let owner = format!("worker-{i}");
            let worker_queue = Queue::new(self.store.clone(), self.run_id, owner, queue_config.clone(), self.backoff);
            let worker = Worker::new(
                worker_queue.clone(),
                self.store.clone(),
                self.fetcher.clone(),
                self.plugins.clone(),
                self.profile.clone(),
                self.runtime_deny.clone(),
                deny_tx.clone(),
                backpressure.clone(),
                self.fetch_profile.clone(),
                self.config.worker.clone(),
            );
            worker_handles.push(tokio::spawn(worker_loop(worker, worker_queue, backpressure.clone(), stop_rx.clone())));
        }
        drop(deny_tx);

        loop {
            tokio::time::sleep(self.config.drain_poll_interval).await;

            let counts = queue.counts().await?;
            if counts.pending == 0 && counts.in_progress == 0 {
                let _ = stop_tx.send(true);
                break;
            }
            if *cancel_rx.borrow() && counts.in_progress == 0 {
                break;
            }
        }

        for handle in worker_handles {
            handle.await??;
        }
        cancel_bridge.abort();
        let _ = deny_consumer.await;

        Ok(if *cancel_rx.borrow() {
            RunStatus::Stopped
        } else {
            RunStatus::Completed
        })
    }

    async fn finalize(&self, status: RunStatus) -> anyhow::Result<RunSummary> {
        self.store.finalize_run(self.run_id, status, Utc::now()).await?;
        let counts = self.store.task_counts(self.run_id).await?;
        let exceptions = self.store.list_exceptions(self.run_id).await?;

        tracing::info!(
            event = "sitesync.executor.finalized",
            run_id = %self.run_id,
            source_name = %self.source_name,
            status = status.as_str(),
            pending = counts.pending,
            in_progress = counts.in_progress,
            finished = counts.finished,
            error = counts.error,
            "run finalized"
        );

        Ok(RunSummary {
            run_id: self.run_id,
            status,
            counts,
            exceptions,
            suggested_deny_rules: self.runtime_deny.added_rules(),
        })
    }
}

async fn run_deny_consumer(rules: Arc<RuntimeDenyRules>, mut rx: mpsc::UnboundedReceiver<sitesync_frontier::DenySignal>) {
    while let Some(signal) = rx.recv().await {
        if let Err(err) = rules.add(&signal.domain, &signal.pattern) {
            tracing::warn!(
                event = "sitesync.executor.deny_rule_error",
                domain = %signal.domain,
                pattern = %signal.pattern,
                error = %err,
                "failed to apply runtime deny rule"
            );
        }
    }
}

async fn bridge_cancel_to_stop(mut cancel_rx: watch::Receiver<bool>, stop_tx: watch::Sender<bool>) {
    loop {
        if *cancel_rx.borrow() {
            let _ = stop_tx.send(true);
            return;
        }
        if cancel_rx.changed().await.is_err() {
            return;
        }
    }
}

/// spec §4.5: "Acquisition is blocked while `in_flight >= N * pages_per_agent`."
async fn worker_loop(
    worker: Worker,
    queue: Queue,
    backpressure: Arc<BackpressureGate>,
    mut stop_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *stop_rx.borrow() {
            return Ok(());
        }

        if !backpressure.wait(&mut stop_rx).await? {
            return Ok(());
        }

        let tasks = queue.acquire(Utc::now()).await?;
        if tasks.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                _ = stop_rx.changed() => {}
            }
            continue;
        }

        for task in tasks {
            if *stop_rx.borrow() {
                queue.release(task.id, Utc::now()).await?;
                continue;
            }
            worker.process_task(task, stop_rx.clone()).await?;
        }
    }
}
