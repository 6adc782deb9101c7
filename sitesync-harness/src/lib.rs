//! In-memory `Fetcher`/`Plugin` fakes for driving the boundary scenarios in
//! spec.md §8 deterministically, without real network I/O. The role here
//! mirrors `FakeRunner` in the harness's HTTP-era counterpart: a stand-in for
//! a real collaborator that lets integration tests control exactly what the
//! core sees.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sitesync_core::fetch::{FetchOutcome, FetchProfile, FetchResult, Fetcher, PermanentFetchError, TransientFetchError};
use sitesync_core::plugin::{AssetRecord, NormalizationError, Plugin};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// A scripted outcome for one fetch call. `Html` is the common case: a 200
/// response whose body is taken as-is and whose outbound links come from
/// `links`.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Html { final_url: String, body: String, links: Vec<String> },
    Transient(String),
    Permanent(String),
}

/// Maps a URL to a queue of outcomes consumed in order, one per call. A URL
/// with no remaining scripted outcomes (or none registered) gets a permanent
/// error, so tests fail loudly instead of hanging.
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    calls: Mutex<HashMap<String, u32>>,
    /// Artificial per-call delay, for tests that need a fetch to still be
    /// in flight when they act (e.g. sending a stop signal).
    delay: Mutex<Option<std::time::Duration>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
        }
    }

    /// Appends one scripted outcome to `url`'s queue.
    pub fn script(&self, url: impl Into<String>, outcome: ScriptedOutcome) {
        self.scripts
            .lock()
            .expect("scripted fetcher mutex poisoned")
            .entry(url.into())
            .or_default()
            .push_back(outcome);
    }

    pub fn call_count(&self, url: &str) -> u32 {
        self.calls.lock().expect("scripted fetcher mutex poisoned").get(url).copied().unwrap_or(0)
    }

    /// Makes every subsequent `fetch` call sleep `delay` before resolving.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().expect("scripted fetcher mutex poisoned") = Some(delay);
    }
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _profile: &FetchProfile) -> FetchOutcome {
        let delay = *self.delay.lock().expect("scripted fetcher mutex poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        *self.calls.lock().expect("scripted fetcher mutex poisoned").entry(url.to_string()).or_insert(0) += 1;

        let next = self
            .scripts
            .lock()
            .expect("scripted fetcher mutex poisoned")
            .get_mut(url)
            .and_then(|q| q.pop_front());

        match next {
            Some(ScriptedOutcome::Html { final_url, body, links }) => {
                let mut session_metadata = serde_json::Map::new();
                session_metadata.insert("links".to_string(), Value::Array(links.into_iter().map(Value::String).collect()));
                FetchOutcome::Ok(FetchResult {
                    final_url,
                    status_code: 200,
                    headers: HashMap::new(),
                    body: body.into_bytes(),
                    fetched_at: Utc::now(),
                    session_metadata: Value::Object(session_metadata),
                })
            }
            Some(ScriptedOutcome::Transient(msg)) => FetchOutcome::Transient(TransientFetchError(msg)),
            Some(ScriptedOutcome::Permanent(msg)) => FetchOutcome::Permanent(PermanentFetchError(msg)),
            None => FetchOutcome::Permanent(PermanentFetchError(format!("no scripted outcome left for {url}"))),
        }
    }
}

/// A plugin that treats every fetch result as an opaque page: the body is
/// the normalized payload verbatim, and outbound links are read back out of
/// `session_metadata.links` (the convention [`ScriptedFetcher`] writes).
pub struct EchoPlugin;

impl Plugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }

    fn matches(&self, _asset_hint: Option<&str>, _fetch_result: &FetchResult) -> bool {
        true
    }

    fn normalize(&self, fetch_result: &FetchResult) -> Result<AssetRecord, NormalizationError> {
        let relationships = fetch_result
            .session_metadata
            .get("links")
            .and_then(Value::as_array)
            .map(|links| links.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(AssetRecord {
            asset_type: "page".to_string(),
            canonical_url: fetch_result.final_url.clone(),
            normalized_payload: fetch_result.body.clone(),
            raw_payload_ref: format!("mem://{}", fetch_result.final_url),
            relationships,
            provenance: Value::Null,
        })
    }
}

pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}
