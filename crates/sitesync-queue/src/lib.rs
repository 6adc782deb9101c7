//! The Task Queue (spec §4.2): a typed handle over [`sitesync_store::Store`]'s
//! task operations, bound to one run and one worker identity so callers never
//! thread `run_id`/`owner` through every call.

mod backpressure;

pub use backpressure::BackpressureGate;

use chrono::{DateTime, Utc};
use sitesync_core::backoff::Backoff;
use sitesync_core::model::Task;
use sitesync_store::{Store, StoreError, TaskCounts};
use std::fmt;
use uuid::Uuid;

#[derive(Debug)]
pub enum QueueError {
    /// `(run_id, url)` was already enqueued. Swallowed by [`Queue::enqueue`]
    /// itself (spec §7); surfaced here for callers that want to observe it.
    DuplicateTask,
    /// The caller no longer holds the lease it thought it did.
    LeaseLost,
    Unavailable(anyhow::Error),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::DuplicateTask => write!(f, "duplicate task"),
            QueueError::LeaseLost => write!(f, "lease lost"),
            QueueError::Unavailable(err) => write!(f, "queue unavailable: {err}"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::Unavailable(err) => err.source(),
            _ => None,
        }
    }
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateTask => QueueError::DuplicateTask,
            StoreError::LeaseLost => QueueError::LeaseLost,
            StoreError::Unavailable(err) => QueueError::Unavailable(err.into()),
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub batch_size: i64,
    pub lease_ttl_secs: i64,
    pub max_retries: i64,
}

#[derive(Clone)]
pub struct Queue {
    store: Store,
    run_id: Uuid,
    owner: String,
    config: QueueConfig,
    backoff: Backoff,
}

impl Queue {
    pub fn new(store: Store, run_id: Uuid, owner: String, config: QueueConfig, backoff: Backoff) -> Self {
        Self {
            store,
            run_id,
            owner,
            config,
            backoff,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// `enqueue` (spec §4.2). Returns `Ok(None)` rather than an error when
    /// the `(run_id, url)` pair is already present — the no-op the Worker's
    /// link-discovery step relies on (spec §7).
    pub async fn enqueue(
        &self,
        url: &str,
        depth: i64,
        source_name: &str,
        plugin_hint: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Uuid>> {
        match self
            .store
            .enqueue_task(self.run_id, url, depth, source_name, plugin_hint, now)
            .await
        {
            Ok(id) => Ok(Some(id)),
            Err(StoreError::DuplicateTask) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    /// `acquire` (spec §4.2): reclaims expired leases for this run, then
    /// leases up to `batch_size` pending tasks under this queue's owner
    /// identity.
    pub async fn acquire(&self, now: DateTime<Utc>) -> QueueResult<Vec<Task>> {
        self.store
            .acquire_tasks(
                self.run_id,
                &self.owner,
                self.config.batch_size,
                self.config.lease_ttl_secs,
                now,
                self.config.max_retries,
                &self.backoff,
            )
            .await
            .map_err(Into::into)
    }

    pub async fn renew(&self, task_id: Uuid, now: DateTime<Utc>) -> QueueResult<()> {
        self.store
            .renew_lease(task_id, &self.owner, now, self.config.lease_ttl_secs)
            .await
            .map_err(Into::into)
    }

    pub async fn finish(&self, task_id: Uuid, now: DateTime<Utc>) -> QueueResult<()> {
        self.store
            .finish_task(task_id, &self.owner, now)
            .await
            .map_err(Into::into)
    }

    /// `fail_transient` (spec §4.2): reschedules with backoff, or converts
    /// to a terminal error past `max_retries`.
    pub async fn fail_transient(&self, task_id: Uuid, error: &str, now: DateTime<Utc>) -> QueueResult<()> {
        self.store
            .fail_transient(
                task_id,
                &self.owner,
                error,
                self.config.max_retries,
                &self.backoff,
                now,
            )
            .await
            .map_err(Into::into)
    }

    pub async fn fail_permanent(&self, task_id: Uuid, error: &str, now: DateTime<Utc>) -> QueueResult<()> {
        self.store
            .fail_permanent(task_id, &self.owner, error, now)
            .await
            .map_err(Into::into)
    }

    /// Cooperative stop (spec §4.5): returns the task to `pending` without
    /// touching `attempt_count`, so a resumed run retries it fresh.
    pub async fn release(&self, task_id: Uuid, now: DateTime<Utc>) -> QueueResult<()> {
        self.store
            .release_task(task_id, &self.owner, now)
            .await
            .map_err(Into::into)
    }

    pub async fn counts(&self) -> QueueResult<TaskCounts> {
        self.store.task_counts(self.run_id).await.map_err(Into::into)
    }
}
