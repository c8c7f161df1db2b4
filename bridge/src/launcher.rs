//! Spawns one `codex exec` process per turn.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::error::Result;
use crate::path_resolver::resolve_command;
use crate::registry::ProcessControl;
use crate::registry::ProcessHandle;
use crate::registry::ProcessRecord;
use crate::registry::ProcessRegistry;
use crate::temp_resources::Attachment;

const EXEC_SUBCOMMAND: &str = "exec";
const SKIP_GIT_REPO_CHECK_FLAG: &str = "--skip-git-repo-check";
const BYPASS_APPROVALS_FLAG: &str = "--dangerously-bypass-approvals-and-sandbox";

/// Forced on top of the inherited environment so the CLI prints plain text.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("TERM", "dumb"),
    ("NO_COLOR", "1"),
    ("FORCE_COLOR", "0"),
    ("CI", "true"),
];

/// Per-turn options as supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TurnOptions {
    pub session_id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub skip_permissions: bool,
    pub images: Vec<Attachment>,
}

/// Fully resolved options for a single spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub cwd: PathBuf,
    pub model: String,
    pub reasoning_effort: String,
    pub skip_permissions: bool,
    pub attachment_paths: Vec<PathBuf>,
    pub temp_dir: Option<PathBuf>,
}

impl LaunchOptions {
    pub fn resolve(options: &TurnOptions, cwd: PathBuf, config: &BridgeConfig) -> Self {
        Self {
            cwd,
            model: non_blank(options.model.as_deref())
                .unwrap_or(&config.default_model)
                .to_string(),
            reasoning_effort: non_blank(options.reasoning_effort.as_deref())
                .unwrap_or(&config.default_reasoning_effort)
                .to_string(),
            skip_permissions: options.skip_permissions,
            attachment_paths: Vec::new(),
            temp_dir: None,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// `gpt-5*` and the `o<digit>` families accept a reasoning effort override.
pub fn is_reasoning_model(model: &str) -> bool {
    if model.starts_with("gpt-5") {
        return true;
    }
    let mut chars = model.chars();
    chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

pub fn build_args(options: &LaunchOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![EXEC_SUBCOMMAND.into()];
    for path in &options.attachment_paths {
        args.push("-i".into());
        args.push(path.clone().into_os_string());
    }
    args.push("-m".into());
    args.push(options.model.clone().into());
    if is_reasoning_model(&options.model) {
        args.push("-c".into());
        args.push(format!("reasoning_effort=\"{}\"", options.reasoning_effort).into());
    }
    args.push(SKIP_GIT_REPO_CHECK_FLAG.into());
    if options.skip_permissions {
        args.push(BYPASS_APPROVALS_FLAG.into());
    }
    args
}

/// Strips control characters and surrounding whitespace from a caller
/// supplied directory. `None` means the current directory.
pub fn clean_working_dir(raw: Option<&Path>) -> Result<PathBuf> {
    let Some(raw) = raw else {
        return Ok(std::env::current_dir()?);
    };
    let cleaned: String = raw
        .to_string_lossy()
        .chars()
        .filter(|c| !c.is_control())
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Ok(std::env::current_dir()?);
    }
    Ok(PathBuf::from(cleaned))
}

pub fn check_working_dir(cwd: &Path) -> Result<()> {
    if cwd.is_dir() {
        Ok(())
    } else {
        Err(BridgeError::DirectoryNotFound {
            path: cwd.to_path_buf(),
        })
    }
}

/// A spawned child registered under `key`. The caller drives it and must
/// release the registry entry when it exits.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub child: Child,
    pub handle: ProcessHandle,
    pub control: ProcessControl,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    configured_path: String,
    interpreter: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            configured_path: config.configured_codex_path(),
            interpreter: config.node_path.clone(),
        }
    }

    pub async fn launch(
        &self,
        prompt: &str,
        options: &LaunchOptions,
        registry: &ProcessRegistry,
        key: &str,
    ) -> Result<LaunchedProcess> {
        let resolved = resolve_command(&self.configured_path, self.interpreter.as_deref());
        let args = build_args(options);
        info!(
            model = %options.model,
            reasoning_effort = %options.reasoning_effort,
            cwd = %options.cwd.display(),
            attachments = options.attachment_paths.len(),
            "launching codex"
        );
        debug!(
            "codex command: {} {} < [prompt via stdin]",
            resolved.display(),
            args.iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        // The directory may have disappeared while attachments were written.
        check_working_dir(&options.cwd)?;

        let mut cmd = Command::new(&resolved.program);
        cmd.args(&resolved.prefix_args)
            .args(&args)
            .current_dir(&options.cwd)
            .envs(ENV_OVERRIDES.iter().copied())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            error!("failed to spawn {}: {err}", resolved.display());
            classify_spawn_error(err, &options.cwd, &resolved.display())
        })?;

        let (handle, control) = ProcessHandle::new(child.id());
        let mut record = ProcessRecord::new(handle.clone());
        record.temp_files = options.attachment_paths.clone();
        record.temp_dir = options.temp_dir.clone();
        registry.register(key, record);

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(write_prompt(stdin, prompt.to_string()));
        }

        Ok(LaunchedProcess {
            child,
            handle,
            control,
            key: key.to_string(),
        })
    }
}

fn classify_spawn_error(err: io::Error, cwd: &Path, command: &str) -> BridgeError {
    match err.kind() {
        io::ErrorKind::NotFound if !cwd.is_dir() => BridgeError::DirectoryNotFound {
            path: cwd.to_path_buf(),
        },
        io::ErrorKind::NotFound => BridgeError::process_not_found(command),
        _ => BridgeError::spawn_failure(err),
    }
}

/// Writes the prompt and closes stdin. A blank prompt closes stdin right
/// away so the child never waits for input.
async fn write_prompt(mut stdin: ChildStdin, prompt: String) {
    if !prompt.trim().is_empty() {
        let mut payload = prompt.into_bytes();
        payload.push(b'\n');
        if let Err(err) = stdin.write_all(&payload).await {
            debug!("failed to write prompt to codex stdin: {err}");
            return;
        }
    }
    if let Err(err) = stdin.shutdown().await {
        debug!("failed to close codex stdin: {err}");
    }
}
