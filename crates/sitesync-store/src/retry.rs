//! Bounded retry for SQLite write contention (spec §4.1: "transient lock
//! contention is retried with bounded exponential backoff (≤ 8 attempts,
//! capped at ~2s)").

use std::time::Duration;

const MAX_ATTEMPTS: u32 = 8;
const CAP_MILLIS: u64 = 2_000;

pub async fn retry_on_busy<F, Fut, T>(mut f: F) -> sqlx::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = sqlx::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) if attempt < MAX_ATTEMPTS && is_busy(&err) => {
                attempt += 1;
                let delay_ms = (25u64 << attempt.min(6)).min(CAP_MILLIS);
                tracing::warn!(
                    event = "sitesync.store.retry",
                    attempt,
                    delay_ms,
                    "retrying write after lock contention"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}
