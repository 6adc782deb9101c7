//! Frontier Filter (spec §4.3): a pure function deciding whether a
//! discovered, canonicalized URL should be enqueued, given a source
//! profile's per-domain allow/deny path globs plus any runtime-added deny
//! rules. Glob compilation follows the `globset` usage in the codex
//! network-proxy's host policy; the runtime-mutable deny overlay follows
//! codex-core's `ArcSwap`-guarded policy manager so many concurrent Worker
//! reads never block the Executor's single writer.

use arc_swap::ArcSwap;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sitesync_core::canonical::{host_of, path_of};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainRules {
    #[serde(default)]
    pub allow_paths: Vec<String>,
    #[serde(default)]
    pub deny_paths: Vec<String>,
}

/// `source.*` configuration surface (spec §6): which domains are in scope
/// and the depth ceiling for this source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceProfile {
    pub max_depth: i64,
    pub allowed_domains: HashMap<String, DomainRules>,
}

#[derive(Debug)]
pub enum FrontierError {
    InvalidGlob { domain: String, pattern: String, source: globset::Error },
}

impl std::fmt::Display for FrontierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrontierError::InvalidGlob { domain, pattern, source } => {
                write!(f, "invalid glob \"{pattern}\" for domain \"{domain}\": {source}")
            }
        }
    }
}

impl std::error::Error for FrontierError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrontierError::InvalidGlob { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    DepthExceeded,
    DomainNotAllowed,
    DeniedByPath,
    NotInAllowList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Enqueue,
    Drop(DropReason),
}

/// A worker's request to add a runtime deny rule, sent over the Executor's
/// deny-rule channel rather than applied directly (Design Notes §9: workers
/// hold a handle to the channel, never a back-reference to the Executor).
#[derive(Debug, Clone)]
pub struct DenySignal {
    pub domain: String,
    pub pattern: String,
}

struct CompiledDomain {
    allow: GlobSet,
    has_allow: bool,
    deny: GlobSet,
}

/// Path segments are matched literally by default; `*` matches one segment,
/// `**` matches any number of segments including zero (spec §4.3).
fn compile(domain: &str, patterns: &[String]) -> Result<GlobSet, FrontierError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|source| FrontierError::InvalidGlob {
                domain: domain.to_string(),
                pattern: pattern.clone(),
                source,
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| FrontierError::InvalidGlob {
        domain: domain.to_string(),
        pattern: patterns.join(","),
        source,
    })
}

/// A `SourceProfile` with every domain's globs pre-compiled once. The
/// profile itself never changes during a run; only the runtime deny
/// overlay does (see [`RuntimeDenyRules`]).
pub struct CompiledProfile {
    max_depth: i64,
    domains: HashMap<String, CompiledDomain>,
}

impl CompiledProfile {
    pub fn compile(profile: &SourceProfile) -> Result<Self, FrontierError> {
        let mut domains = HashMap::with_capacity(profile.allowed_domains.len());
        for (domain, rules) in &profile.allowed_domains {
            domains.insert(
                domain.clone(),
                CompiledDomain {
                    allow: compile(domain, &rules.allow_paths)?,
                    has_allow: !rules.allow_paths.is_empty(),
                    deny: compile(domain, &rules.deny_paths)?,
                },
            );
        }
        Ok(Self {
            max_depth: profile.max_depth,
            domains,
        })
    }
}

/// The Executor's single-writer, many-reader overlay of deny globs added at
/// runtime (auth-redirect suppression, spec §4.4 step 4). Readers get a
/// consistent snapshot per call via `ArcSwap::load`.
struct RuntimeDenyState {
    /// Raw patterns per domain, kept alongside the compiled `GlobSet`s so a
    /// new addition can recompile without losing earlier patterns.
    patterns: HashMap<String, Vec<String>>,
    /// Insertion-ordered `(domain, pattern)` pairs, for the end-of-run
    /// "suggested permanent config update" summary (spec §4.5, §6).
    added: Vec<(String, String)>,
}

pub struct RuntimeDenyRules {
    by_domain: ArcSwap<HashMap<String, GlobSet>>,
    state: std::sync::Mutex<RuntimeDenyState>,
}

impl Default for RuntimeDenyRules {
    fn default() -> Self {
        Self {
            by_domain: ArcSwap::from_pointee(HashMap::new()),
            state: std::sync::Mutex::new(RuntimeDenyState {
                patterns: HashMap::new(),
                added: Vec::new(),
            }),
        }
    }
}

impl RuntimeDenyRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `pattern` into `domain`'s runtime deny set. Idempotent: adding
    /// the same `(domain, pattern)` twice is a no-op the second time.
    pub fn add(&self, domain: &str, pattern: &str) -> Result<(), FrontierError> {
        let mut state = self.state.lock().expect("runtime deny rules mutex poisoned");
        let key = (domain.to_string(), pattern.to_string());
        if state.added.contains(&key) {
            return Ok(());
        }

        let domain_patterns = state.patterns.entry(domain.to_string()).or_default();
        domain_patterns.push(pattern.to_string());
        let compiled_set = compile(domain, domain_patterns)?;

        let current = self.by_domain.load();
        let mut next = HashMap::with_capacity(current.len() + 1);
        for (d, set) in current.iter() {
            if d != domain {
                next.insert(d.clone(), set.clone());
            }
        }
        next.insert(domain.to_string(), compiled_set);
        self.by_domain.store(Arc::new(next));
        state.added.push(key);

        tracing::info!(
            event = "sitesync.frontier.deny_rule_added",
            domain,
            pattern,
            "runtime deny rule added"
        );
        Ok(())
    }

    /// All `(domain, pattern)` pairs added this run, for the end-of-run
    /// summary's suggested permanent config update.
    pub fn added_rules(&self) -> Vec<(String, String)> {
        self.state.lock().expect("runtime deny rules mutex poisoned").added.clone()
    }

    fn matches(&self, domain: &str, path: &str) -> bool {
        self.by_domain
            .load()
            .get(domain)
            .is_some_and(|set| set.is_match(path))
    }
}

/// Evaluates a discovered URL against the compiled profile and the runtime
/// deny overlay (spec §4.3 steps 1-5). Pure and side-effect-free: `url` must
/// already be canonicalized by the caller.
pub fn evaluate(
    url: &str,
    depth: i64,
    profile: &CompiledProfile,
    runtime_deny: &RuntimeDenyRules,
) -> FilterOutcome {
    if depth > profile.max_depth {
        return FilterOutcome::Drop(DropReason::DepthExceeded);
    }

    let Some(host) = host_of(url) else {
        return FilterOutcome::Drop(DropReason::DomainNotAllowed);
    };

    let Some(domain) = profile.domains.get(&host) else {
        return FilterOutcome::Drop(DropReason::DomainNotAllowed);
    };

    let path = path_of(url);

    if domain.deny.is_match(&path) || runtime_deny.matches(&host, &path) {
        return FilterOutcome::Drop(DropReason::DeniedByPath);
    }

    if !domain.has_allow || domain.allow.is_match(&path) {
        FilterOutcome::Enqueue
    } else {
        FilterOutcome::Drop(DropReason::NotInAllowList)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(allow: &[&str], deny: &[&str]) -> CompiledProfile {
        let mut allowed_domains = HashMap::new();
        allowed_domains.insert(
            "example.com".to_string(),
            DomainRules {
                allow_paths: allow.iter().map(|s| s.to_string()).collect(),
                deny_paths: deny.iter().map(|s| s.to_string()).collect(),
            },
        );
        CompiledProfile::compile(&SourceProfile {
            max_depth: 5,
            allowed_domains,
        })
        .unwrap()
    }

    #[test]
    fn deny_beats_allow() {
        let p = profile(&["/docs/**"], &["/docs/private/**"]);
        let runtime = RuntimeDenyRules::new();

        assert_eq!(
            evaluate("https://example.com/docs/a", 1, &p, &runtime),
            FilterOutcome::Enqueue
        );
        assert_eq!(
            evaluate("https://example.com/docs/private/b", 1, &p, &runtime),
            FilterOutcome::Drop(DropReason::DeniedByPath)
        );
        assert_eq!(
            evaluate("https://example.com/blog/c", 1, &p, &runtime),
            FilterOutcome::Drop(DropReason::NotInAllowList)
        );
        assert_eq!(
            evaluate("https://other.com/x", 1, &p, &runtime),
            FilterOutcome::Drop(DropReason::DomainNotAllowed)
        );
    }

    #[test]
    fn empty_allow_list_accepts_anything_not_denied() {
        let p = profile(&[], &["/admin/**"]);
        let runtime = RuntimeDenyRules::new();

        assert_eq!(
            evaluate("https://example.com/whatever", 1, &p, &runtime),
            FilterOutcome::Enqueue
        );
        assert_eq!(
            evaluate("https://example.com/admin/x", 1, &p, &runtime),
            FilterOutcome::Drop(DropReason::DeniedByPath)
        );
    }

    #[test]
    fn depth_ceiling_rejects_past_max_depth() {
        let p = profile(&[], &[]);
        let runtime = RuntimeDenyRules::new();

        assert_eq!(
            evaluate("https://example.com/a", 5, &p, &runtime),
            FilterOutcome::Enqueue
        );
        assert_eq!(
            evaluate("https://example.com/a", 6, &p, &runtime),
            FilterOutcome::Drop(DropReason::DepthExceeded)
        );
    }

    #[test]
    fn runtime_deny_rule_applies_after_addition() {
        let p = profile(&[], &[]);
        let runtime = RuntimeDenyRules::new();

        assert_eq!(
            evaluate("https://example.com/auth/login", 1, &p, &runtime),
            FilterOutcome::Enqueue
        );

        runtime.add("example.com", "/auth/**").unwrap();

        assert_eq!(
            evaluate("https://example.com/auth/login", 1, &p, &runtime),
            FilterOutcome::Drop(DropReason::DeniedByPath)
        );
        assert_eq!(runtime.added_rules(), vec![("example.com".to_string(), "/auth/**".to_string())]);
    }
}
