use crate::{retry_on_busy, Store, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use sitesync_core::model::{Asset, AssetVersion, DiffClass};
use sqlx::Row;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub asset_id: Uuid,
    /// `None` when the new payload hashed the same as the asset's latest
    /// version: spec P8, "An AssetVersion with `diff_class=unchanged` is
    /// never persisted."
    pub version_id: Option<Uuid>,
    pub diff_class: DiffClass,
}

impl Store {
    /// Upserts the `Asset` row for `(source_name, url)` and, unless the
    /// content is unchanged from the most recent version, inserts a new
    /// `AssetVersion` (spec §4.4 step 6, invariant I6, property P8).
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_asset_version(
        &self,
        run_id: Uuid,
        source_name: &str,
        url: &str,
        asset_type: &str,
        normalized_hash: &str,
        raw_hash: &str,
        payload_ref: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome> {
        let pool = self.pool.clone();
        retry_on_busy(move || {
            let pool = pool.clone();
            async move {
                let mut conn = pool.acquire().await?;
                sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

                let existing = sqlx::query("SELECT id FROM assets WHERE source_name = ? AND url = ?")
                    .bind(source_name)
                    .bind(url)
                    .fetch_optional(&mut *conn)
                    .await?;

                let asset_id: Uuid = match existing {
                    Some(row) => {
                        let id: Uuid = row.try_get("id")?;
                        sqlx::query("UPDATE assets SET last_seen_at = ? WHERE id = ?")
                            .bind(now)
                            .bind(id)
                            .execute(&mut *conn)
                            .await?;
                        id
                    }
                    None => {
                        let id = Uuid::new_v4();
                        sqlx::query(
                            r#"
                            INSERT INTO assets (id, source_name, url, asset_type, first_seen_at, last_seen_at)
                            VALUES (?, ?, ?, ?, ?, ?)
                            "#,
                        )
                        .bind(id)
                        .bind(source_name)
                        .bind(url)
                        .bind(asset_type)
                        .bind(now)
                        .bind(now)
                        .execute(&mut *conn)
                        .await?;
                        id
                    }
                };

                let previous = sqlx::query(
                    r#"
                    SELECT normalized_hash FROM asset_versions
                    WHERE asset_id = ? ORDER BY created_at DESC LIMIT 1
                    "#,
                )
                .bind(asset_id)
                .fetch_optional(&mut *conn)
                .await?;

                let diff_class = match &previous {
                    None => DiffClass::New,
                    Some(row) => {
                        let prev_hash: String = row.try_get("normalized_hash")?;
                        if prev_hash == normalized_hash {
                            DiffClass::Unchanged
                        } else {
                            DiffClass::Updated
                        }
                    }
                };

                let version_id = if diff_class == DiffClass::Unchanged {
                    None
                } else {
                    let id = Uuid::new_v4();
                    sqlx::query(
                        r#"
                        INSERT INTO asset_versions
                          (id, asset_id, run_id, normalized_hash, raw_hash, payload_ref, diff_class, created_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(id)
                    .bind(asset_id)
                    .bind(run_id)
                    .bind(normalized_hash)
                    .bind(raw_hash)
                    .bind(payload_ref)
                    .bind(diff_class.as_str())
                    .bind(now)
                    .execute(&mut *conn)
                    .await?;
                    Some(id)
                };

                sqlx::query("COMMIT").execute(&mut *conn).await?;

                Ok(UpsertOutcome {
                    asset_id,
                    version_id,
                    diff_class,
                })
            }
        })
        .await
        .map_err(Into::into)
    }

    pub async fn get_asset(&self, source_name: &str, url: &str) -> StoreResult<Option<Asset>> {
        let row = retry_on_busy(|| async {
            sqlx::query(
                r#"
                SELECT id, source_name, url, asset_type, first_seen_at, last_seen_at
                FROM assets WHERE source_name = ? AND url = ?
                "#,
            )
            .bind(source_name)
            .bind(url)
            .fetch_optional(&self.pool)
            .await
        })
        .await?;

        row.map(|row| {
            Ok(Asset {
                id: row.try_get("id").map_err(StoreError::from)?,
                source_name: row.try_get("source_name").map_err(StoreError::from)?,
                url: row.try_get("url").map_err(StoreError::from)?,
                asset_type: row.try_get("asset_type").map_err(StoreError::from)?,
                first_seen_at: row.try_get("first_seen_at").map_err(StoreError::from)?,
                last_seen_at: row.try_get("last_seen_at").map_err(StoreError::from)?,
            })
        })
        .transpose()
    }

    /// All versions recorded for `asset_id`, newest first. Mostly useful for
    /// tests and future introspection tooling; the crawl itself only ever
    /// needs the most recent one, which `upsert_asset_version` already reads.
    pub async fn list_asset_versions(&self, asset_id: Uuid) -> StoreResult<Vec<AssetVersion>> {
        let rows = retry_on_busy(|| async {
            sqlx::query(
                r#"
                SELECT id, asset_id, run_id, normalized_hash, raw_hash, payload_ref, diff_class, created_at
                FROM asset_versions WHERE asset_id = ? ORDER BY created_at DESC
                "#,
            )
            .bind(asset_id)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        rows.into_iter()
            .map(|row| {
                let diff_class_str: String = row.try_get("diff_class").map_err(StoreError::from)?;
                Ok(AssetVersion {
                    id: row.try_get("id").map_err(StoreError::from)?,
                    asset_id: row.try_get("asset_id").map_err(StoreError::from)?,
                    run_id: row.try_get("run_id").map_err(StoreError::from)?,
                    normalized_hash: row.try_get("normalized_hash").map_err(StoreError::from)?,
                    raw_hash: row.try_get("raw_hash").map_err(StoreError::from)?,
                    payload_ref: row.try_get("payload_ref").map_err(StoreError::from)?,
                    diff_class: match diff_class_str.as_str() {
                        "new" => DiffClass::New,
                        "updated" => DiffClass::Updated,
                        _ => DiffClass::Unchanged,
                    },
                    created_at: row.try_get("created_at").map_err(StoreError::from)?,
                })
            })
            .collect()
    }

    /// Assets in `source_name` last seen strictly before `since` — the
    /// candidates for "missing" exceptions (SPEC_FULL.md §11).
    pub async fn assets_not_seen_since(
        &self,
        source_name: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<Asset>> {
        let rows = retry_on_busy(|| async {
            sqlx::query(
                r#"
                SELECT id, source_name, url, asset_type, first_seen_at, last_seen_at
                FROM assets WHERE source_name = ? AND last_seen_at < ?
                "#,
            )
            .bind(source_name)
            .bind(since)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Asset {
                    id: row.try_get("id").map_err(StoreError::from)?,
                    source_name: row.try_get("source_name").map_err(StoreError::from)?,
                    url: row.try_get("url").map_err(StoreError::from)?,
                    asset_type: row.try_get("asset_type").map_err(StoreError::from)?,
                    first_seen_at: row.try_get("first_seen_at").map_err(StoreError::from)?,
                    last_seen_at: row.try_get("last_seen_at").map_err(StoreError::from)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// P8: an unchanged hash never gets its own `AssetVersion` row; the
    /// caller can only observe the repeat by reading back the prior one.
    #[tokio::test]
    async fn unchanged_hash_is_not_persisted_as_a_new_version() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();

        let first = store
            .upsert_asset_version(run_id, "src", "https://example.com/a", "page", "hash-1", "raw-1", "ref-1", now)
            .await
            .unwrap();
        assert_eq!(first.diff_class, DiffClass::New);
        assert!(first.version_id.is_some());

        let second = store
            .upsert_asset_version(run_id, "src", "https://example.com/a", "page", "hash-1", "raw-1", "ref-1", now)
            .await
            .unwrap();
        assert_eq!(second.diff_class, DiffClass::Unchanged);
        assert!(second.version_id.is_none());
        assert_eq!(second.asset_id, first.asset_id);

        let versions = store.list_asset_versions(first.asset_id).await.unwrap();
        assert_eq!(versions.len(), 1);
    }

    #[tokio::test]
    async fn changed_hash_inserts_an_updated_version() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let now = Utc::now();

        let first = store
            .upsert_asset_version(run_id, "src", "https://example.com/a", "page", "hash-1", "raw-1", "ref-1", now)
            .await
            .unwrap();

        let second = store
            .upsert_asset_version(run_id, "src", "https://example.com/a", "page", "hash-2", "raw-2", "ref-2", now)
            .await
            .unwrap();
        assert_eq!(second.diff_class, DiffClass::Updated);
        assert_eq!(second.asset_id, first.asset_id);

        let versions = store.list_asset_versions(first.asset_id).await.unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[tokio::test]
    async fn assets_not_seen_since_finds_only_stale_ones() {
        let store = Store::in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);

        store
            .upsert_asset_version(run_id, "src", "https://example.com/stale", "page", "h1", "r1", "ref", t0)
            .await
            .unwrap();
        store
            .upsert_asset_version(run_id, "src", "https://example.com/fresh", "page", "h2", "r2", "ref", t1)
            .await
            .unwrap();

        let stale = store.assets_not_seen_since("src", t1).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].url, "https://example.com/stale");
    }
}
