use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::BridgeError;
use crate::error::Result;

/// Environment variable that points at the Codex executable when the config
/// file does not name one.
pub const CODEX_PATH_ENV_VAR: &str = "CODEX_PATH";

/// Command used when neither the config nor the environment names one.
pub const DEFAULT_CODEX_COMMAND: &str = "codex";

const DEFAULT_MODEL: &str = "gpt-5";
const DEFAULT_REASONING_EFFORT: &str = "medium";
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_ABORT_GRACE_MS: u64 = 2_000;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;
const DEFAULT_FLUSH_THRESHOLD_BYTES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Explicit path to the `codex` executable. Takes precedence over
    /// `CODEX_PATH`.
    pub codex_path: Option<PathBuf>,
    /// Interpreter used when the executable resolves to a script.
    pub node_path: Option<PathBuf>,
    pub default_model: String,
    pub default_reasoning_effort: String,
    pub startup_timeout_ms: u64,
    pub abort_grace_ms: u64,
    pub flush_interval_ms: u64,
    pub flush_threshold_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            codex_path: None,
            node_path: None,
            default_model: DEFAULT_MODEL.to_string(),
            default_reasoning_effort: DEFAULT_REASONING_EFFORT.to_string(),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            abort_grace_ms: DEFAULT_ABORT_GRACE_MS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD_BYTES,
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| BridgeError::Config(err.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            BridgeError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// The executable string as configured, before any symlink or script
    /// resolution.
    pub fn configured_codex_path(&self) -> String {
        if let Some(path) = &self.codex_path {
            return path.to_string_lossy().into_owned();
        }
        match std::env::var(CODEX_PATH_ENV_VAR) {
            Ok(value) if !value.trim().is_empty() => value,
            _ => DEFAULT_CODEX_COMMAND.to_string(),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        // A zero period would make `tokio::time::interval` panic.
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}
