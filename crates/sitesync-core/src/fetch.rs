//! The `Fetcher` contract (spec §6). The core never implements a fetcher —
//! headless-browser and HTTP fetching are out of scope (§1) — it only
//! defines what a fetcher must give back and must honor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub final_url: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub session_metadata: Value,
}

/// Network/timeout/5xx/anti-bot throttle. Retried with backoff up to
/// `max_retries` (spec §7).
#[derive(Debug, Clone)]
pub struct TransientFetchError(pub String);

impl fmt::Display for TransientFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transient fetch error: {}", self.0)
    }
}

impl std::error::Error for TransientFetchError {}

/// 4xx non-auth, unresolvable host, or an explicit non-retryable signal. No
/// retry; terminal `error` plus an exception row (spec §7).
#[derive(Debug, Clone)]
pub struct PermanentFetchError(pub String);

impl fmt::Display for PermanentFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "permanent fetch error: {}", self.0)
    }
}

impl std::error::Error for PermanentFetchError {}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Ok(FetchResult),
    Transient(TransientFetchError),
    Permanent(PermanentFetchError),
}

/// A source profile view handed to the fetcher: enough for it to decide
/// headers, proxies, or session reuse without depending on the rest of the
/// core's configuration surface.
#[derive(Debug, Clone)]
pub struct FetchProfile {
    pub source_name: String,
    pub user_agent: Option<String>,
}

/// External collaborator contract (spec §6). Implementations must honor
/// cooperative cancellation: once the supplied token is cancelled, `fetch`
/// should return promptly rather than continue waiting on I/O.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, profile: &FetchProfile) -> FetchOutcome;
}
