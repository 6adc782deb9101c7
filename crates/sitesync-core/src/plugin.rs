//! The `Plugin` contract (spec §6). Asset plugins / HTML normalization are
//! out of scope (§1); the core only defines the shape a plugin must produce.

use crate::fetch::FetchResult;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone)]
pub struct AssetRecord {
    pub asset_type: String,
    pub canonical_url: String,
    pub normalized_payload: Vec<u8>,
    pub raw_payload_ref: String,
    /// Outbound links discovered while normalizing, to be canonicalized and
    /// offered to the Frontier Filter by the Worker.
    pub relationships: Vec<String>,
    pub provenance: Value,
}

#[derive(Debug, Clone)]
pub struct NormalizationError(pub String);

impl fmt::Display for NormalizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "normalization error: {}", self.0)
    }
}

impl std::error::Error for NormalizationError {}

/// External collaborator contract (spec §6). `matches` is a pure capability
/// check; `normalize` does the actual transformation and may fail.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, asset_hint: Option<&str>, fetch_result: &FetchResult) -> bool;

    fn normalize(&self, fetch_result: &FetchResult) -> Result<AssetRecord, NormalizationError>;
}

/// A closed, read-only-after-startup registry (Design Notes §9: "re-architect
/// as a closed registry populated once during Orchestrator startup"). Plugin
/// selection is a deterministic capability match followed by a fallback to a
/// declared default.
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
    default_index: Option<usize>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            default_index: None,
        }
    }

    /// Registers a plugin. Built-in plugins must be registered before any
    /// host-discovered ones (spec §6), so callers should push built-ins
    /// first and discovered plugins afterward.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Marks the most recently registered plugin as the fallback default.
    pub fn set_last_as_default(&mut self) {
        if !self.plugins.is_empty() {
            self.default_index = Some(self.plugins.len() - 1);
        }
    }

    /// Selects a plugin by hint first, then by capability match, falling
    /// back to the declared default.
    pub fn select(&self, plugin_hint: Option<&str>, fetch_result: &FetchResult) -> Option<&dyn Plugin> {
        if let Some(hint) = plugin_hint {
            if let Some(p) = self.plugins.iter().find(|p| p.name() == hint) {
                return Some(p.as_ref());
            }
        }

        if let Some(p) = self
            .plugins
            .iter()
            .find(|p| p.matches(plugin_hint, fetch_result))
        {
            return Some(p.as_ref());
        }

        self.default_index.map(|i| self.plugins[i].as_ref())
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-provided plugin-discovery interface (spec §6): an enumeration of
/// `(name, factory)` pairs. One failing factory must not prevent others from
/// loading.
pub trait PluginFactory {
    fn name(&self) -> &str;
    fn build(&self) -> anyhow::Result<Box<dyn Plugin>>;
}

/// Loads discovered plugins into `registry`, logging and skipping any
/// factory that fails to build instead of aborting the whole registry.
pub fn load_discovered(registry: &mut PluginRegistry, factories: &[Box<dyn PluginFactory>]) {
    for factory in factories {
        match factory.build() {
            Ok(plugin) => registry.register(plugin),
            Err(err) => {
                tracing::warn!(
                    event = "sitesync.plugin.load_failed",
                    plugin = factory.name(),
                    error = %err,
                    "plugin factory failed; continuing with remaining plugins"
                );
            }
        }
    }
}
