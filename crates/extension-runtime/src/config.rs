//! Runtime configuration
//!
//! ```yaml
//! chart_dir: ./charts
//! modules:
//!   - id: acd
//!     backend: { type: acd }
//!     extensions:
//!       - { id: "101", chart: basic-call.yaml, type: acd, variables: [[queue, sales]] }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::router::DEFAULT_LANE_CAPACITY;

/// Environment variable that replaces `chart_dir`.
pub const CHART_DIR_ENV: &str = "EXTENSION_CHART_DIR";

/// Variable seeded with the extension id in every context.
pub const EXTENSION_VARIABLE: &str = "_extension.Extension";

/// Extension type tag; decides which backend accepts the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    Acd,
    Freeswitch,
    FreeswitchAcd,
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ExtensionKind::Acd => "acd",
            ExtensionKind::Freeswitch => "freeswitch",
            ExtensionKind::FreeswitchAcd => "freeswitch_acd",
        };
        f.write_str(tag)
    }
}

/// One `extensions` entry as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionEntry {
    #[serde(default)]
    pub id: String,
    /// Chart reference, relative to the chart directory.
    pub chart: String,
    #[serde(rename = "type")]
    pub kind: ExtensionKind,
    /// Initial variable bindings, applied in order.
    #[serde(default)]
    pub variables: Vec<(String, String)>,
}

/// One item of a module's `extensions` list.
///
/// Items that do not parse as an [`ExtensionEntry`] are kept raw so the
/// module can reject them one by one instead of failing the whole file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtensionSlot {
    Entry(ExtensionEntry),
    Invalid(serde_yaml::Value),
}

impl From<ExtensionEntry> for ExtensionSlot {
    fn from(entry: ExtensionEntry) -> Self {
        ExtensionSlot::Entry(entry)
    }
}

/// Immutable description of one extension, owned by its module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionConfig {
    pub id: String,
    pub module: String,
    pub chart: String,
    pub kind: ExtensionKind,
    pub variables: Vec<(String, String)>,
}

impl ExtensionConfig {
    pub fn new(
        id: impl Into<String>,
        module: impl Into<String>,
        chart: impl Into<String>,
        kind: ExtensionKind,
    ) -> Self {
        Self {
            id: id.into(),
            module: module.into(),
            chart: chart.into(),
            kind,
            variables: Vec::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.push((key.into(), value.into()));
        self
    }

    /// Bindings a new context starts with: configured ones, then the
    /// extension id under [`EXTENSION_VARIABLE`].
    pub fn initial_bindings(&self) -> Vec<(String, String)> {
        let mut bindings = self.variables.clone();
        bindings.push((EXTENSION_VARIABLE.to_string(), self.id.clone()));
        bindings
    }
}

/// Connection settings of a FreeSWITCH event socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSwitchConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl Default for FreeSwitchConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: String::new(),
            password: String::new(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl FreeSwitchConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Backend variant of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackendConfig {
    Acd,
    Freeswitch(FreeSwitchConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub id: String,
    pub backend: BackendConfig,
    #[serde(default)]
    pub extensions: Vec<ExtensionSlot>,
}

impl ModuleConfig {
    /// Validated extension set of this module.
    ///
    /// Unparseable entries, entries with an empty id and repeated ids are
    /// reported and skipped; the first occurrence of an id wins.
    pub fn extension_configs(&self) -> (Vec<ExtensionConfig>, Vec<ConfigError>) {
        let mut accepted = Vec::with_capacity(self.extensions.len());
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();

        for (index, slot) in self.extensions.iter().enumerate() {
            let entry = match slot {
                ExtensionSlot::Entry(entry) => entry,
                ExtensionSlot::Invalid(value) => {
                    rejected.push(ConfigError::InvalidEntry {
                        module: self.id.clone(),
                        index,
                        message: entry_error(value),
                    });
                    continue;
                }
            };
            let id = entry.id.trim();
            if id.is_empty() {
                rejected.push(ConfigError::EmptyExtensionId {
                    module: self.id.clone(),
                    index,
                });
                continue;
            }
            if !seen.insert(id.to_string()) {
                rejected.push(ConfigError::DuplicateExtension {
                    module: self.id.clone(),
                    extension: id.to_string(),
                });
                continue;
            }
            accepted.push(ExtensionConfig {
                id: id.to_string(),
                module: self.id.clone(),
                chart: entry.chart.clone(),
                kind: entry.kind,
                variables: entry.variables.clone(),
            });
        }

        (accepted, rejected)
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory chart references are resolved against.
    #[serde(default = "default_chart_dir")]
    pub chart_dir: PathBuf,
    /// Capacity of the shared event channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Events that may wait for one extension before the router blocks.
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
    /// Upper bound on waiting for producers to stop.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            chart_dir: default_chart_dir(),
            channel_capacity: default_channel_capacity(),
            lane_capacity: default_lane_capacity(),
            stop_timeout_ms: default_stop_timeout_ms(),
            modules: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Load a configuration file and apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup such as the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(CHART_DIR_ENV).filter(|dir| !dir.trim().is_empty()) {
            tracing::debug!(chart_dir = %dir, "chart directory overridden from environment");
            self.chart_dir = PathBuf::from(dir);
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn with_module(mut self, module: ModuleConfig) -> Self {
        self.modules.push(module);
        self
    }
}

// Re-parse a rejected item to recover serde's description of the problem.
fn entry_error(value: &serde_yaml::Value) -> String {
    match serde_yaml::from_value::<ExtensionEntry>(value.clone()) {
        Err(err) => err.to_string(),
        Ok(_) => "entry is not a mapping of id, chart and type".to_string(),
    }
}

fn default_chart_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_lane_capacity() -> usize {
    DEFAULT_LANE_CAPACITY
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8021
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}
