use clap::Parser;
use serde::Serialize;

/// The `crawler.*` configuration surface (spec §6), parsed from the
/// environment the same way `harness/src/config.rs`'s `HarnessConfig` is:
/// one `clap::Parser` struct, `#[arg(long, env = "...")]` per field, parsed
/// once at startup via [`CrawlerConfig::from_env`].
///
/// Per-source settings (`source.allowed_domains`, `source.max_depth`) are not
/// here — they live on [`sitesync_frontier::SourceProfile`], which the CLI
/// layer loads from its own config file and hands to the Orchestrator
/// directly (parsing that file is out of scope).
#[derive(Parser, Debug, Clone, Serialize)]
pub struct CrawlerConfig {
    /// Worker count `N`.
    #[arg(long, env = "CRAWLER_PARALLEL_AGENTS", default_value_t = 4)]
    pub parallel_agents: usize,

    /// Acquisition batch size per worker.
    #[arg(long, env = "CRAWLER_PAGES_PER_AGENT", default_value_t = 4)]
    pub pages_per_agent: i64,

    /// Upper bound on `attempt_count` before a task becomes a permanent `error`.
    #[arg(long, env = "CRAWLER_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: i64,

    /// Hard per-task fetch timeout.
    #[arg(long, env = "CRAWLER_FETCH_TIMEOUT_SECONDS", default_value_t = 30)]
    pub fetch_timeout_seconds: u64,

    /// Lease duration; renew interval is `lease_ttl / 3`.
    #[arg(long, env = "CRAWLER_LEASE_TTL_SECONDS", default_value_t = 90)]
    pub lease_ttl_seconds: i64,

    /// Explicit backpressure ceiling. Defaults to `parallel_agents *
    /// pages_per_agent` when unset (SPEC_FULL.md §12).
    #[arg(long, env = "CRAWLER_MAX_IN_FLIGHT")]
    pub max_in_flight: Option<i64>,

    #[arg(long, env = "CRAWLER_BACKOFF_BASE_SECONDS", default_value_t = 2)]
    pub backoff_base_seconds: u64,

    #[arg(long, env = "CRAWLER_BACKOFF_CAP_SECONDS", default_value_t = 120)]
    pub backoff_cap_seconds: u64,

    #[arg(long, env = "CRAWLER_JITTER_FRACTION", default_value_t = 0.25)]
    pub jitter_fraction: f64,

    /// Path prefixes treated as an auth redirect for the link-suppression
    /// rule (spec §4.4 step 4). Comma-separated in the environment.
    #[arg(long, env = "CRAWLER_AUTH_REDIRECT_PREFIXES", value_delimiter = ',', default_value = "/auth")]
    pub auth_redirect_prefixes: Vec<String>,

    /// Drain detector poll interval, milliseconds (spec §4.5: "e.g., 500 ms").
    #[arg(long, env = "CRAWLER_DRAIN_POLL_MILLIS", default_value_t = 500)]
    pub drain_poll_millis: u64,

    /// Embedded database file. Defaults match spec.md §6.
    #[arg(long, env = "STORAGE_PATH", default_value = "./sitesync.sqlite")]
    pub storage_path: String,
}

impl CrawlerConfig {
    /// Parses config from the environment only (no CLI parsing), mirroring
    /// `HarnessConfig::from_env`'s single-fake-argv trick so clap doesn't try
    /// to interpret the enclosing binary's own subcommand flags here.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["sitesync-orchestrator"]))
    }

    pub fn max_in_flight(&self) -> i64 {
        self.max_in_flight
            .unwrap_or_else(|| self.parallel_agents as i64 * self.pages_per_agent)
    }

    pub fn backoff(&self) -> sitesync_core::backoff::Backoff {
        sitesync_core::backoff::Backoff {
            base: std::time::Duration::from_secs(self.backoff_base_seconds),
            cap: std::time::Duration::from_secs(self.backoff_cap_seconds),
            jitter_fraction: self.jitter_fraction,
        }
    }
}
