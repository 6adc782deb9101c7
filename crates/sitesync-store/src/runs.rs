use crate::{retry_on_busy, Store, StoreResult};
use chrono::{DateTime, Utc};
use sitesync_core::model::{Run, RunStatus};
use sqlx::Row;
use uuid::Uuid;

impl Store {
    pub async fn create_run(
        &self,
        source_name: &str,
        started_at: DateTime<Utc>,
        config_snapshot: &serde_json::Value,
    ) -> StoreResult<Run> {
        let id = Uuid::new_v4();
        let config_json = serde_json::to_string(config_snapshot)
            .map_err(|err| crate::StoreError::Unavailable(sqlx::Error::Decode(Box::new(err))))?;

        retry_on_busy(|| async {
            sqlx::query(
                r#"
                INSERT INTO runs (id, source_name, started_at, completed_at, status, config_snapshot_json)
                VALUES (?, ?, ?, NULL, ?, ?)
                "#,
            )
            .bind(id)
            .bind(source_name)
            .bind(started_at)
            .bind(RunStatus::Running.as_str())
            .bind(&config_json)
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(Run {
            id,
            source_name: source_name.to_string(),
            started_at,
            completed_at: None,
            status: RunStatus::Running,
            config_snapshot: config_snapshot.clone(),
        })
    }

    /// Newest run for `source_name` whose status is `running` or `stopped`
    /// (spec §4.6 step 2), if any.
    pub async fn find_resumable_run(&self, source_name: &str) -> StoreResult<Option<Run>> {
        let row = retry_on_busy(|| async {
            sqlx::query(
                r#"
                SELECT id, source_name, started_at, completed_at, status, config_snapshot_json
                FROM runs
                WHERE source_name = ? AND status IN ('running', 'stopped')
                ORDER BY started_at DESC
                LIMIT 1
                "#,
            )
            .bind(source_name)
            .fetch_optional(&self.pool)
            .await
        })
        .await?;

        row.map(row_to_run).transpose()
    }

    pub async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        let row = retry_on_busy(|| async {
            sqlx::query(
                r#"
                SELECT id, source_name, started_at, completed_at, status, config_snapshot_json
                FROM runs
                WHERE id = ?
                "#,
            )
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
        })
        .await?;

        row.map(row_to_run).transpose()
    }

    /// Reopens a `stopped` run for resume (spec §4.6 step 2): clears
    /// `completed_at` and sets `status='running'` so the subsequent
    /// `finalize_run` (which only ever matches `status='running'`) finalizes
    /// this resumed attempt exactly once instead of finding no row to update.
    pub async fn reopen_run(&self, run_id: Uuid) -> StoreResult<()> {
        retry_on_busy(|| async {
            sqlx::query(
                r#"
                UPDATE runs
                SET status = 'running', completed_at = NULL
                WHERE id = ? AND status = 'stopped'
                "#,
            )
            .bind(run_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(())
    }

    /// Finalizes a run exactly once (spec §4.5 "Finalize"). `completed_at`
    /// is set for every terminal status, including `stopped` (Open Question,
    /// decided in favor of observability — see SPEC_FULL.md §12).
    pub async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        retry_on_busy(|| async {
            sqlx::query(
                r#"
                UPDATE runs
                SET status = ?, completed_at = ?
                WHERE id = ? AND status = 'running'
                "#,
            )
            .bind(status.as_str())
            .bind(completed_at)
            .bind(run_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(())
    }
}

fn row_to_run(row: sqlx::sqlite::SqliteRow) -> StoreResult<Run> {
    let status_str: String = row
        .try_get("status")
        .map_err(|e| crate::StoreError::Unavailable(e))?;
    let config_json: String = row
        .try_get("config_snapshot_json")
        .map_err(|e| crate::StoreError::Unavailable(e))?;

    Ok(Run {
        id: row.try_get("id").map_err(|e| crate::StoreError::Unavailable(e))?,
        source_name: row
            .try_get("source_name")
            .map_err(|e| crate::StoreError::Unavailable(e))?,
        started_at: row
            .try_get("started_at")
            .map_err(|e| crate::StoreError::Unavailable(e))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(|e| crate::StoreError::Unavailable(e))?,
        status: RunStatus::parse(&status_str).unwrap_or(RunStatus::Error),
        config_snapshot: serde_json::from_str(&config_json).unwrap_or(serde_json::Value::Null),
    })
}
