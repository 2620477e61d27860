//! foothold configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FootholdConfig {
    /// Where facts and tamper records are persisted.
    pub store: StoreConfig,
    /// Remote command execution defaults.
    pub platform: PlatformConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one document per target. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Timeout applied to `run` when the caller does not pass one.
    pub default_timeout_secs: u64,
    /// After a timeout or cancel: how long to wait between interrupt and kill.
    pub kill_grace_ms: u64,
    /// Interpreter used for shell snippets on the target.
    pub shell: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Also write logs to this file.
    pub file: Option<PathBuf>,
}

// ============================================================
// Defaults
// ============================================================

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_dir().map(|d| d.join("foothold")),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 120,
            kill_grace_ms: 500,
            shell: "/bin/sh".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "foothold=info".into(),
            json: false,
            file: None,
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl FootholdConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Default config location (`<config dir>/foothold/foothold.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("foothold").join("foothold.toml"))
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Config with persistence disabled, used by tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            store: StoreConfig { path: None },
            ..Self::default()
        }
    }
}
