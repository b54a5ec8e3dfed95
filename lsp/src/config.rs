//! Configuration for the language server layer.
//!
//! Loaded from `~/.lodestar/config.toml`; every field has a default so an
//! empty or missing file yields a working setup.
//!
//! ```toml
//! idle_timeout_secs = 300
//! settle_window_ms = 1000
//!
//! [scan]
//! max_depth = 5
//! ignore = ["third_party"]
//!
//! [servers.rust]
//! request_timeout_secs = 90
//!
//! [servers.zig]
//! command = "zls"
//! file_extensions = ["zig"]
//! root_markers = ["build.zig"]
//! ```
//!
//! Environment variables override the file:
//! `LODESTAR_LSP_IDLE_SECS`, `LODESTAR_LSP_SETTLE_MS`,
//! `LODESTAR_LSP_SCAN_DEPTH` and
//! `LODESTAR_LSP_<LANG>_{INIT,REQUEST,INDEXING}_TIMEOUT_SECS`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::registry::WorkspaceKind;

const ENV_PREFIX: &str = "LODESTAR_LSP_";

/// Environment variables stripped from spawned servers by default.
///
/// Patterns support a leading and/or trailing `*`.
pub const DEFAULT_ENV_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_SECRET",
    "*_SECRET_KEY",
    "*_TOKEN",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "AWS_*",
    "ANTHROPIC_*",
    "OPENAI_*",
    "GEMINI_*",
];

// bool::default() is false, so only true needs a fn
const fn default_true() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LspConfig {
    /// Master switch. Default: true.
    pub enabled: bool,
    /// Idle window after which the held server is stopped.
    pub idle_timeout_secs: u64,
    /// Quiet window for the diagnostics settle waiter.
    pub settle_window_ms: u64,
    /// How long to wait for a first progress token before declaring a
    /// server "not reporting progress".
    pub indexing_grace_ms: u64,
    pub scan: ScanConfig,
    /// Replaces [`DEFAULT_ENV_DENYLIST`] when set.
    pub env_denylist: Option<Vec<String>>,
    /// Per-language overrides and additions, keyed by language id.
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout_secs: 300,
            settle_window_ms: 1000,
            indexing_grace_ms: 3000,
            scan: ScanConfig::default(),
            env_denylist: None,
            servers: BTreeMap::new(),
        }
    }
}

/// Workspace scan settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub max_depth: usize,
    /// Directory names skipped in addition to the built-in ignore set.
    pub ignore: Vec<String>,
    pub cache_ttl_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            ignore: Vec::new(),
            cache_ttl_secs: 60,
        }
    }
}

/// Override or addition for one language server.
///
/// For built-in languages every field is optional. A new language needs at
/// least `command`, `file_extensions` and `root_markers`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    /// LSP language identifier sent in `didOpen`. Defaults to the table key.
    pub language_id: Option<String>,
    pub file_extensions: Option<Vec<String>>,
    pub root_markers: Option<Vec<String>>,
    pub workspace: Option<WorkspaceKind>,
    /// Replaces the built-in `initializationOptions`.
    pub initialization_options: Option<serde_json::Value>,
    pub init_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub indexing_timeout_secs: Option<u64>,
    /// Set to false to drop a built-in server.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: None,
            language_id: None,
            file_extensions: None,
            root_markers: None,
            workspace: None,
            initialization_options: None,
            init_timeout_secs: None,
            request_timeout_secs: None,
            indexing_timeout_secs: None,
            enabled: true,
        }
    }
}

impl LspConfig {
    /// `~/.lodestar/config.toml`.
    #[must_use]
    pub fn path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".lodestar").join("config.toml"))
    }

    /// Load the default config file. `Ok(None)` when it does not exist.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = Self::path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {}: {err}", path.display());
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };
        toml::from_str(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {}: {err}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }

    /// Apply `LODESTAR_LSP_*` variables from the process environment.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_env_overrides(std::env::vars());
        self
    }

    /// Apply `LODESTAR_LSP_*` overrides from `vars`. Unparsable values are
    /// logged and ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let Ok(number) = value.trim().parse::<u64>() else {
                tracing::warn!("Ignoring {key}={value:?}: not a non-negative integer");
                continue;
            };

            match rest {
                "IDLE_SECS" => self.idle_timeout_secs = number,
                "SETTLE_MS" => self.settle_window_ms = number,
                "SCAN_DEPTH" => {
                    self.scan.max_depth = usize::try_from(number).unwrap_or(usize::MAX);
                }
                _ => self.apply_server_timeout(&key, rest, number),
            }
        }
    }

    fn apply_server_timeout(&mut self, key: &str, rest: &str, secs: u64) {
        const SUFFIXES: [&str; 3] = [
            "_INIT_TIMEOUT_SECS",
            "_REQUEST_TIMEOUT_SECS",
            "_INDEXING_TIMEOUT_SECS",
        ];

        for (slot, suffix) in SUFFIXES.iter().enumerate() {
            let Some(lang) = rest.strip_suffix(suffix) else {
                continue;
            };
            if lang.is_empty() {
                break;
            }
            let entry = self.servers.entry(lang.to_ascii_lowercase()).or_default();
            let field = match slot {
                0 => &mut entry.init_timeout_secs,
                1 => &mut entry.request_timeout_secs,
                _ => &mut entry.indexing_timeout_secs,
            };
            *field = Some(secs);
            return;
        }
        tracing::debug!("Ignoring unrecognized override {key}");
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    #[must_use]
    pub fn indexing_grace(&self) -> Duration {
        Duration::from_millis(self.indexing_grace_ms)
    }

    /// Effective environment denylist.
    #[must_use]
    pub fn env_denylist(&self) -> Vec<String> {
        match &self.env_denylist {
            Some(list) => list.clone(),
            None => DEFAULT_ENV_DENYLIST.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl ScanConfig {
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Minimal glob matcher for env var denylist patterns.
/// Handles `*_SUFFIX`, `PREFIX_*`, `*_INFIX*`, and exact match.
/// Both pattern and key are compared in uppercase.
pub(crate) fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.starts_with('*'), pat.ends_with('*')) {
        (true, true) if pat.len() >= 2 => key_upper.contains(&pat[1..pat.len() - 1]),
        (true, true) => true,
        (true, false) => key_upper.ends_with(&pat[1..]),
        (false, true) => key_upper.starts_with(&pat[..pat.len() - 1]),
        (false, false) => key_upper == pat,
    }
}
