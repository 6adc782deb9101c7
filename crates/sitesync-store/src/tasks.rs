use crate::{retry_on_busy, Store, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use sitesync_core::backoff::Backoff;
use sitesync_core::model::{Task, TaskStatus};
use sqlx::pool::PoolConnection;
use sqlx::{Row, Sqlite, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TaskCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub finished: i64,
    pub error: i64,
}

async fn begin_immediate(pool: &SqlitePool) -> sqlx::Result<PoolConnection<Sqlite>> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(conn)
}

async fn commit(mut conn: PoolConnection<Sqlite>) -> sqlx::Result<()> {
    sqlx::query("COMMIT").execute(&mut *conn).await?;
    Ok(())
}

async fn rollback(mut conn: PoolConnection<Sqlite>) {
    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
}

impl Store {
    /// `enqueue` (spec §4.2). Idempotent under retry: a second call with the
    /// same `(run_id, url)` returns `StoreError::DuplicateTask`, which
    /// callers treat as benign (spec §7).
    pub async fn enqueue_task(
        &self,
        run_id: Uuid,
        url: &str,
        depth: i64,
        source_name: &str,
        plugin_hint: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        retry_on_busy(|| async {
            sqlx::query(
                r#"
                INSERT INTO tasks
                  (id, run_id, url, depth, source_name, plugin_hint, status,
                   attempt_count, next_run_at, lease_owner, lease_expires_at,
                   last_error, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, NULL, NULL, NULL, ?)
                "#,
            )
            .bind(id)
            .bind(run_id)
            .bind(url)
            .bind(depth)
            .bind(source_name)
            .bind(plugin_hint)
            .bind(TaskStatus::Pending.as_str())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(id)
    }

    /// `acquire` (spec §4.2): reclaim expired leases, then select and lease
    /// up to `batch_size` pending tasks, all in one `BEGIN IMMEDIATE`
    /// transaction.
    pub async fn acquire_tasks(
        &self,
        run_id: Uuid,
        owner: &str,
        batch_size: i64,
        lease_ttl_secs: i64,
        now: DateTime<Utc>,
        max_retries: i64,
        backoff: &Backoff,
    ) -> StoreResult<Vec<Task>> {
        retry_on_busy(|| async {
            let mut conn = begin_immediate(&self.pool).await?;

            // 1. Reclaim: find in_progress tasks whose lease already expired.
            let expired = sqlx::query(
                r#"
                SELECT id, attempt_count FROM tasks
                WHERE run_id = ? AND status = 'in_progress' AND lease_expires_at <= ?
                "#,
            )
            .bind(run_id)
            .bind(now)
            .fetch_all(&mut *conn)
            .await?;

            let mut reclaimed = 0usize;
            for row in &expired {
                let task_id: Uuid = row.try_get("id")?;
                let attempt_count: i64 = row.try_get("attempt_count")?;
                let new_attempt = attempt_count + 1;

                if new_attempt > max_retries {
                    sqlx::query(
                        r#"
                        UPDATE tasks
                        SET status = 'error', lease_owner = NULL, lease_expires_at = NULL,
                            attempt_count = ?, last_error = 'lease expired', updated_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(new_attempt)
                    .bind(now)
                    .bind(task_id)
                    .execute(&mut *conn)
                    .await?;
                } else {
                    let next_run_at = now
                        + chrono::Duration::from_std(backoff.compute(new_attempt))
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    sqlx::query(
                        r#"
                        UPDATE tasks
                        SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL,
                            attempt_count = ?, last_error = 'lease expired',
                            next_run_at = ?, updated_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(new_attempt)
                    .bind(next_run_at)
                    .bind(now)
                    .bind(task_id)
                    .execute(&mut *conn)
                    .await?;
                }
                reclaimed += 1;
            }
            if reclaimed > 0 {
                tracing::info!(
                    event = "sitesync.queue.reclaimed",
                    run_id = %run_id,
                    count = reclaimed,
                    "reclaimed expired leases"
                );
            }

            // 2. Select: breadth-first within backoff scheduling.
            let candidates = sqlx::query(
                r#"
                SELECT id FROM tasks
                WHERE run_id = ? AND status = 'pending' AND next_run_at <= ?
                ORDER BY next_run_at ASC, depth ASC, id ASC
                LIMIT ?
                "#,
            )
            .bind(run_id)
            .bind(now)
            .bind(batch_size)
            .fetch_all(&mut *conn)
            .await?;

            let lease_expires_at = now + chrono::Duration::seconds(lease_ttl_secs);
            let mut leased = Vec::with_capacity(candidates.len());
            for row in &candidates {
                let task_id: Uuid = row.try_get("id")?;
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'in_progress', lease_owner = ?, lease_expires_at = ?,
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(owner)
                .bind(lease_expires_at)
                .bind(now)
                .bind(task_id)
                .execute(&mut *conn)
                .await?;
                leased.push(task_id);
            }

            let mut tasks = Vec::with_capacity(leased.len());
            for task_id in leased {
                if let Some(task) = fetch_task(&mut conn, task_id).await? {
                    tasks.push(task);
                }
            }

            commit(conn).await?;
            Ok(tasks)
        })
        .await
        .map_err(Into::into)
    }

    pub async fn renew_lease(
        &self,
        task_id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        lease_ttl_secs: i64,
    ) -> StoreResult<()> {
        let lease_expires_at = now + chrono::Duration::seconds(lease_ttl_secs);
        let result = retry_on_busy(|| async {
            sqlx::query(
                r#"
                UPDATE tasks
                SET lease_expires_at = ?, updated_at = ?
                WHERE id = ? AND lease_owner = ? AND status = 'in_progress'
                "#,
            )
            .bind(lease_expires_at)
            .bind(now)
            .bind(task_id)
            .bind(owner)
            .execute(&self.pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost);
        }
        Ok(())
    }

    pub async fn finish_task(&self, task_id: Uuid, owner: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let result = retry_on_busy(|| async {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'finished', lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
                WHERE id = ? AND lease_owner = ? AND status = 'in_progress'
                "#,
            )
            .bind(now)
            .bind(task_id)
            .bind(owner)
            .execute(&self.pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost);
        }
        Ok(())
    }

    /// `fail_transient` (spec §4.2): increments `attempt_count`; past
    /// `max_retries` it becomes a terminal `error` instead of rescheduling.
    pub async fn fail_transient(
        &self,
        task_id: Uuid,
        owner: &str,
        error: &str,
        max_retries: i64,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        retry_on_busy(|| async {
            let mut conn = begin_immediate(&self.pool).await?;

            let row = sqlx::query(
                r#"
                SELECT attempt_count FROM tasks
                WHERE id = ? AND lease_owner = ? AND status = 'in_progress'
                "#,
            )
            .bind(task_id)
            .bind(owner)
            .fetch_optional(&mut *conn)
            .await?;

            let Some(row) = row else {
                rollback(conn).await;
                return Err(sqlx::Error::RowNotFound);
            };

            let attempt_count: i64 = row.try_get("attempt_count")?;
            let new_attempt = attempt_count + 1;

            if new_attempt > max_retries {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'error', lease_owner = NULL, lease_expires_at = NULL,
                        attempt_count = ?, last_error = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(new_attempt)
                .bind(error)
                .bind(now)
                .bind(task_id)
                .execute(&mut *conn)
                .await?;
            } else {
                let next_run_at = now
                    + chrono::Duration::from_std(backoff.compute(new_attempt)).unwrap_or_else(|_| chrono::Duration::zero());
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL,
                        attempt_count = ?, last_error = ?, next_run_at = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(new_attempt)
                .bind(error)
                .bind(next_run_at)
                .bind(now)
                .bind(task_id)
                .execute(&mut *conn)
                .await?;
            }

            commit(conn).await?;
            Ok(())
        })
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::LeaseLost,
            other => other.into(),
        })
    }

    pub async fn fail_permanent(
        &self,
        task_id: Uuid,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = retry_on_busy(|| async {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'error', lease_owner = NULL, lease_expires_at = NULL,
                    last_error = ?, updated_at = ?
                WHERE id = ? AND lease_owner = ? AND status = 'in_progress'
                "#,
            )
            .bind(error)
            .bind(now)
            .bind(task_id)
            .bind(owner)
            .execute(&self.pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost);
        }
        Ok(())
    }

    /// Cooperative stop (spec §4.2, §4.5): release without incrementing
    /// `attempt_count`.
    pub async fn release_task(&self, task_id: Uuid, owner: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let result = retry_on_busy(|| async {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
                WHERE id = ? AND lease_owner = ? AND status = 'in_progress'
                "#,
            )
            .bind(now)
            .bind(task_id)
            .bind(owner)
            .execute(&self.pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost);
        }
        Ok(())
    }

    pub async fn task_counts(&self, run_id: Uuid) -> StoreResult<TaskCounts> {
        let rows = retry_on_busy(|| async {
            sqlx::query(
                r#"
                SELECT status, COUNT(*) as n FROM tasks WHERE run_id = ? GROUP BY status
                "#,
            )
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        let mut counts = TaskCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => counts.pending = n,
                Some(TaskStatus::InProgress) => counts.in_progress = n,
                Some(TaskStatus::Finished) => counts.finished = n,
                Some(TaskStatus::Error) => counts.error = n,
                None => {}
            }
        }
        Ok(counts)
    }

    pub async fn get_task(&self, task_id: Uuid) -> StoreResult<Option<Task>> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::from)?;
        fetch_task(&mut conn, task_id).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff {
            base: std::time::Duration::from_millis(1),
            cap: std::time::Duration::from_millis(5),
            jitter_fraction: 0.0,
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_under_retry() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();

        let first = store.enqueue_task(run_id, "https://example.com/a", 0, "src", None, now).await;
        assert!(first.is_ok());

        let second = store.enqueue_task(run_id, "https://example.com/a", 0, "src", None, now).await;
        assert!(matches!(second, Err(StoreError::DuplicateTask)));

        let counts = store.task_counts(run_id).await.unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn acquire_leases_at_most_batch_size_and_marks_in_progress() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();

        for i in 0..5 {
            store
                .enqueue_task(run_id, &format!("https://example.com/{i}"), 0, "src", None, now)
                .await
                .unwrap();
        }

        let leased = store
            .acquire_tasks(run_id, "worker-1", 2, 30, now, 3, &backoff())
            .await
            .unwrap();
        assert_eq!(leased.len(), 2);
        for task in &leased {
            assert_eq!(task.status, TaskStatus::InProgress);
            assert_eq!(task.lease_owner.as_deref(), Some("worker-1"));
        }

        let counts = store.task_counts(run_id).await.unwrap();
        assert_eq!(counts.in_progress, 2);
        assert_eq!(counts.pending, 3);
    }

    /// I4: a second owner's acquire never leases a task already validly
    /// leased to the first.
    #[tokio::test]
    async fn acquire_never_double_leases_an_unexpired_task() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        store.enqueue_task(run_id, "https://example.com/a", 0, "src", None, now).await.unwrap();

        let first = store.acquire_tasks(run_id, "worker-1", 5, 30, now, 3, &backoff()).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = store.acquire_tasks(run_id, "worker-2", 5, 30, now, 3, &backoff()).await.unwrap();
        assert!(second.is_empty());
    }

    /// Boundary scenario 3 (spec.md §8): a stale in-progress lease is
    /// reclaimed to `pending` with `attempt_count` incremented, then
    /// re-leased on the very next `acquire` call.
    #[tokio::test]
    async fn acquire_reclaims_expired_lease_then_releases_it() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        store.enqueue_task(run_id, "https://example.com/a", 0, "src", None, now).await.unwrap();

        // Lease with ttl=0 so it is already stale by the time we look again.
        let leased = store.acquire_tasks(run_id, "worker-1", 5, 0, now, 3, &backoff()).await.unwrap();
        assert_eq!(leased.len(), 1);
        let task_id = leased[0].id;

        let later = now + chrono::Duration::milliseconds(50);
        let reclaimed = store.acquire_tasks(run_id, "worker-2", 5, 30, later, 3, &backoff()).await.unwrap();

        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, task_id);
        assert_eq!(reclaimed[0].attempt_count, 1);
        assert_eq!(reclaimed[0].status, TaskStatus::InProgress);
        assert_eq!(reclaimed[0].lease_owner.as_deref(), Some("worker-2"));
    }

    /// I3: reclamation past `max_retries` becomes a terminal error instead
    /// of another pending cycle.
    #[tokio::test]
    async fn acquire_reclaims_past_max_retries_into_error() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        store.enqueue_task(run_id, "https://example.com/a", 0, "src", None, now).await.unwrap();

        // max_retries = 0: the very first reclaim already exceeds it.
        let leased = store.acquire_tasks(run_id, "worker-1", 5, 0, now, 0, &backoff()).await.unwrap();
        let task_id = leased[0].id;

        let later = now + chrono::Duration::milliseconds(50);
        let reclaimed = store.acquire_tasks(run_id, "worker-2", 5, 30, later, 0, &backoff()).await.unwrap();
        assert!(reclaimed.is_empty());

        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.attempt_count, 1);
        assert!(task.lease_owner.is_none());
    }

    #[tokio::test]
    async fn renew_extends_lease_only_for_matching_owner() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        store.enqueue_task(run_id, "https://example.com/a", 0, "src", None, now).await.unwrap();
        let leased = store.acquire_tasks(run_id, "worker-1", 5, 30, now, 3, &backoff()).await.unwrap();
        let task_id = leased[0].id;

        let later = now + chrono::Duration::seconds(1);
        assert!(store.renew_lease(task_id, "worker-1", later, 60).await.is_ok());
        assert!(matches!(
            store.renew_lease(task_id, "worker-2", later, 60).await,
            Err(StoreError::LeaseLost)
        ));
    }

    #[tokio::test]
    async fn finish_requires_matching_lease_and_is_terminal() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        store.enqueue_task(run_id, "https://example.com/a", 0, "src", None, now).await.unwrap();
        let leased = store.acquire_tasks(run_id, "worker-1", 5, 30, now, 3, &backoff()).await.unwrap();
        let task_id = leased[0].id;

        assert!(matches!(
            store.finish_task(task_id, "worker-2", now).await,
            Err(StoreError::LeaseLost)
        ));
        assert!(store.finish_task(task_id, "worker-1", now).await.is_ok());

        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Finished);

        // I2: finished never reverts.
        assert!(matches!(
            store.finish_task(task_id, "worker-1", now).await,
            Err(StoreError::LeaseLost)
        ));
    }

    #[tokio::test]
    async fn fail_transient_reschedules_until_max_retries_then_errors() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        store.enqueue_task(run_id, "https://example.com/a", 0, "src", None, now).await.unwrap();

        let b = backoff();
        let mut task_id = None;
        for attempt in 1..=3 {
            let leased = store.acquire_tasks(run_id, "worker-1", 5, 30, now, 2, &b).await.unwrap();
            assert_eq!(leased.len(), 1, "expected a task ready to lease on attempt {attempt}");
            task_id = Some(leased[0].id);

            store
                .fail_transient(leased[0].id, "worker-1", "boom", 2, &b, now)
                .await
                .unwrap();

            let task = store.get_task(leased[0].id).await.unwrap().unwrap();
            assert_eq!(task.attempt_count, attempt);
            if attempt <= 2 {
                assert_eq!(task.status, TaskStatus::Pending);
            } else {
                assert_eq!(task.status, TaskStatus::Error);
            }
        }

        let task = store.get_task(task_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.attempt_count, 3);
    }

    #[tokio::test]
    async fn fail_permanent_is_terminal_regardless_of_attempt_count() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        store.enqueue_task(run_id, "https://example.com/a", 0, "src", None, now).await.unwrap();
        let leased = store.acquire_tasks(run_id, "worker-1", 5, 30, now, 3, &backoff()).await.unwrap();

        store.fail_permanent(leased[0].id, "worker-1", "nope", now).await.unwrap();

        let task = store.get_task(leased[0].id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.attempt_count, 0);
    }

    #[tokio::test]
    async fn release_returns_to_pending_without_incrementing_attempts() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        store.enqueue_task(run_id, "https://example.com/a", 0, "src", None, now).await.unwrap();
        let leased = store.acquire_tasks(run_id, "worker-1", 5, 30, now, 3, &backoff()).await.unwrap();

        store.release_task(leased[0].id, "worker-1", now).await.unwrap();

        let task = store.get_task(leased[0].id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(task.lease_owner.is_none());
    }

    #[tokio::test]
    async fn acquire_orders_breadth_first_by_depth_then_id() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        store.enqueue_task(run_id, "https://example.com/deep", 2, "src", None, now).await.unwrap();
        store.enqueue_task(run_id, "https://example.com/shallow", 0, "src", None, now).await.unwrap();

        let leased = store.acquire_tasks(run_id, "worker-1", 5, 30, now, 3, &backoff()).await.unwrap();
        assert_eq!(leased.len(), 2);
        assert_eq!(leased[0].url, "https://example.com/shallow");
        assert_eq!(leased[1].url, "https://example.com/deep");
    }
}

async fn fetch_task(conn: &mut sqlx::sqlite::SqliteConnection, task_id: Uuid) -> sqlx::Result<Option<Task>> {
    let row = sqlx::query(
        r#"
        SELECT id, run_id, url, depth, source_name, plugin_hint, status, attempt_count,
               next_run_at, lease_owner, lease_expires_at, last_error, updated_at
        FROM tasks WHERE id = ?
        "#,
    )
    .bind(task_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else { return Ok(None) };
    let status: String = row.try_get("status")?;

    Ok(Some(Task {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        url: row.try_get("url")?,
        depth: row.try_get("depth")?,
        source_name: row.try_get("source_name")?,
        plugin_hint: row.try_get("plugin_hint")?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Error),
        attempt_count: row.try_get("attempt_count")?,
        next_run_at: row.try_get("next_run_at")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        last_error: row.try_get("last_error")?,
        updated_at: row.try_get("updated_at")?,
    }))
}
