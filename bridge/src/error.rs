use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(
        "Working directory does not exist: {}\n\nThe project directory has been deleted or moved.\nPlease select a different project or restore the directory.",
        path.display()
    )]
    DirectoryNotFound { path: PathBuf },

    #[error(
        "Failed to start Codex CLI: {source}\n\nPlease ensure Codex CLI is installed and accessible.\nYou can either:\n1. Install Codex CLI globally: npm install -g @openai/codex\n2. Set CODEX_PATH environment variable to the full path of the codex executable\n3. Add the codex executable to your system PATH\nCurrent CODEX_PATH: {codex_path_env}"
    )]
    SpawnFailure {
        #[source]
        source: std::io::Error,
        codex_path_env: String,
    },

    #[error(
        "Codex CLI not found\n\nThe 'codex' command could not be found on your system.\n\nPlease ensure Codex CLI is installed:\n1. Install Codex CLI: npm install -g @openai/codex\n2. If installed in a custom location, set CODEX_PATH environment variable:\n   export CODEX_PATH=/path/to/codex\n3. Or add the codex executable to your system PATH\n\nCurrent CODEX_PATH: {codex_path_env}\nAttempted command: {command}"
    )]
    ProcessNotFound {
        command: String,
        codex_path_env: String,
    },

    #[error("Codex process error: {source}")]
    ProcessRuntime {
        #[source]
        source: std::io::Error,
    },

    #[error("Codex CLI timeout - no response received")]
    Timeout,

    #[error("invalid bridge configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Machine-readable error category carried on `error` events as `errorType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DirectoryNotFound,
    SpawnFailure,
    ProcessNotFound,
    ProcessRuntimeError,
    Timeout,
}

impl BridgeError {
    pub(crate) fn spawn_failure(source: std::io::Error) -> Self {
        Self::SpawnFailure {
            source,
            codex_path_env: codex_path_env(),
        }
    }

    pub(crate) fn process_not_found(command: impl Into<String>) -> Self {
        Self::ProcessNotFound {
            command: command.into(),
            codex_path_env: codex_path_env(),
        }
    }

    pub(crate) fn process_runtime(source: std::io::Error) -> Self {
        Self::ProcessRuntime { source }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::DirectoryNotFound { .. } => Some(ErrorKind::DirectoryNotFound),
            Self::SpawnFailure { .. } => Some(ErrorKind::SpawnFailure),
            Self::ProcessNotFound { .. } => Some(ErrorKind::ProcessNotFound),
            Self::ProcessRuntime { .. } | Self::Io(_) => Some(ErrorKind::ProcessRuntimeError),
            Self::Timeout => Some(ErrorKind::Timeout),
            Self::Config(_) => None,
        }
    }
}

fn codex_path_env() -> String {
    std::env::var(crate::config::CODEX_PATH_ENV_VAR).unwrap_or_else(|_| "(not set)".to_string())
}
