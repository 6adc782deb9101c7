use crate::{retry_on_busy, Store, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use sitesync_core::model::{Exception, ExceptionKind};
use sqlx::Row;
use uuid::Uuid;

impl Store {
    /// Records a fetch/normalization failure or a missing asset
    /// (spec §4.4 step on failure classification; SPEC_FULL.md §11 for
    /// `Missing`).
    pub async fn insert_exception(
        &self,
        run_id: Uuid,
        task_id: Option<Uuid>,
        url: &str,
        kind: ExceptionKind,
        message: &str,
        context: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        let context_json = serde_json::to_string(context)
            .map_err(|err| StoreError::Unavailable(sqlx::Error::Decode(Box::new(err))))?;

        retry_on_busy(|| async {
            sqlx::query(
                r#"
                INSERT INTO exceptions (id, run_id, task_id, url, kind, message, context_json, created_at, resolved_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)
                "#,
            )
            .bind(id)
            .bind(run_id)
            .bind(task_id)
            .bind(url)
            .bind(kind.as_str())
            .bind(message)
            .bind(&context_json)
            .bind(now)
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(id)
    }

    pub async fn resolve_exception(&self, exception_id: Uuid, resolved_at: DateTime<Utc>) -> StoreResult<()> {
        retry_on_busy(|| async {
            sqlx::query("UPDATE exceptions SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL")
                .bind(resolved_at)
                .bind(exception_id)
                .execute(&self.pool)
                .await
        })
        .await?;

        Ok(())
    }

    /// Every unresolved `missing` exception for `source_name`, across all
    /// runs — not just the current one (SPEC_FULL.md §11: an asset can go
    /// missing in one run and only reappear several resumes later, so
    /// auto-resolution has to look back further than the current run's own
    /// exception rows).
    pub async fn list_unresolved_missing_for_source(&self, source_name: &str) -> StoreResult<Vec<Exception>> {
        let rows = retry_on_busy(|| async {
            sqlx::query(
                r#"
                SELECT e.id, e.run_id, e.task_id, e.url, e.kind, e.message, e.context_json,
                       e.created_at, e.resolved_at
                FROM exceptions e
                JOIN runs r ON r.id = e.run_id
                WHERE r.source_name = ? AND e.kind = 'missing' AND e.resolved_at IS NULL
                ORDER BY e.created_at
                "#,
            )
            .bind(source_name)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        rows.into_iter().map(row_to_exception).collect()
    }

    pub async fn list_exceptions(&self, run_id: Uuid) -> StoreResult<Vec<Exception>> {
        let rows = retry_on_busy(|| async {
            sqlx::query(
                r#"
                SELECT id, run_id, task_id, url, kind, message, context_json, created_at, resolved_at
                FROM exceptions WHERE run_id = ? ORDER BY created_at
                "#,
            )
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        rows.into_iter().map(row_to_exception).collect()
    }
}

fn row_to_exception(row: sqlx::sqlite::SqliteRow) -> StoreResult<Exception> {
    let kind_str: String = row.try_get("kind").map_err(StoreError::from)?;
    let context_json: String = row.try_get("context_json").map_err(StoreError::from)?;

    Ok(Exception {
        id: row.try_get("id").map_err(StoreError::from)?,
        run_id: row.try_get("run_id").map_err(StoreError::from)?,
        task_id: row.try_get("task_id").map_err(StoreError::from)?,
        url: row.try_get("url").map_err(StoreError::from)?,
        kind: ExceptionKind::parse(&kind_str).unwrap_or(ExceptionKind::PermanentFetch),
        message: row.try_get("message").map_err(StoreError::from)?,
        context_json: serde_json::from_str(&context_json).unwrap_or(serde_json::Value::Null),
        created_at: row.try_get("created_at").map_err(StoreError::from)?,
        resolved_at: row.try_get("resolved_at").map_err(StoreError::from)?,
    })
}
