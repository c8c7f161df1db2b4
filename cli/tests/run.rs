#![cfg(unix)]

mod common;

use anyhow::Context;
use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::Workspace;
use common::parse_events;

#[test]
fn run_streams_events_as_json_lines() -> Result<()> {
    let workspace =
        Workspace::new("cat > /dev/null\necho 'model: gpt-5'\necho 'hello from codex'\n")?;

    let output = Command::cargo_bin("codex-bridge")?
        .arg("--config")
        .arg(workspace.config())
        .arg("run")
        .arg("--cwd")
        .arg(workspace.project())
        .arg("hi")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let events = parse_events(&output)?;
    assert_eq!(events[0]["type"], "session-created");
    assert!(events.contains(&json!({"type": "message", "content": "hello from codex"})));
    assert_eq!(
        events.last(),
        Some(&json!({"type": "complete", "exitCode": 0, "isNewSession": true}))
    );
    Ok(())
}

#[test]
fn run_exit_code_follows_codex() -> Result<()> {
    let workspace = Workspace::new("cat > /dev/null\necho 'half done'\nexit 4\n")?;

    Command::cargo_bin("codex-bridge")?
        .arg("--config")
        .arg(workspace.config())
        .arg("run")
        .arg("--cwd")
        .arg(workspace.project())
        .arg("hi")
        .assert()
        .code(4)
        .stdout(predicate::str::contains("\"exitCode\":4"));
    Ok(())
}

#[test]
fn run_in_missing_directory_fails() -> Result<()> {
    let workspace = Workspace::new("echo 'never runs'\n")?;

    Command::cargo_bin("codex-bridge")?
        .arg("--config")
        .arg(workspace.config())
        .arg("run")
        .arg("--cwd")
        .arg(workspace.dir.path().join("missing"))
        .arg("hi")
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"errorType\":\"directory_not_found\""))
        .stdout(predicate::str::contains("never runs").not());
    Ok(())
}

#[test]
fn sessions_dir_persists_history() -> Result<()> {
    let workspace = Workspace::new("cat > /dev/null\necho 'stored answer'\n")?;
    let sessions = workspace.dir.path().join("sessions");

    Command::cargo_bin("codex-bridge")?
        .arg("--config")
        .arg(workspace.config())
        .arg("--sessions-dir")
        .arg(&sessions)
        .arg("run")
        .arg("--cwd")
        .arg(workspace.project())
        .arg("--session-id")
        .arg("codex_42")
        .arg("remember this")
        .assert()
        .success();

    let raw = std::fs::read_to_string(sessions.join("codex_42.json"))?;
    let session: serde_json::Value = serde_json::from_str(&raw)?;
    assert_eq!(session["id"], "codex_42");
    let contents: Vec<_> = session["messages"]
        .as_array()
        .context("messages must be an array")?
        .iter()
        .map(|message| (message["role"].clone(), message["content"].clone()))
        .collect();
    assert_eq!(
        contents,
        vec![
            (json!("user"), json!("remember this")),
            (json!("assistant"), json!("stored answer")),
        ]
    );
    Ok(())
}

#[test]
fn invalid_config_is_reported() -> Result<()> {
    let workspace = Workspace::new("")?;
    std::fs::write(workspace.config(), "startup_timeout_ms = \"soon\"\n")?;

    Command::cargo_bin("codex-bridge")?
        .arg("--config")
        .arg(workspace.config())
        .arg("run")
        .arg("hi")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
    Ok(())
}
