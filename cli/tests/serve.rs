#![cfg(unix)]

mod common;

use anyhow::Result;
use assert_cmd::Command;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::Workspace;
use common::parse_events;

#[test]
fn serve_runs_turns_and_answers_aborts() -> Result<()> {
    let workspace = Workspace::new("cat > /dev/null\necho 'served'\n")?;
    let run = json!({
        "type": "run",
        "prompt": "hi",
        "options": {"cwd": workspace.project(), "sessionId": "codex_7"}
    });
    let stdin = format!(
        "{run}\nnot json\n{}\n",
        json!({"type": "abort", "sessionId": "nobody"})
    );

    let output = Command::cargo_bin("codex-bridge")?
        .arg("--config")
        .arg(workspace.config())
        .arg("serve")
        .write_stdin(stdin)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let events = parse_events(&output)?;
    assert!(events.contains(&json!({"type": "message", "content": "served"})));
    assert!(events.contains(&json!({"type": "complete", "exitCode": 0, "isNewSession": false})));
    let aborted = json!({"type": "session-aborted", "sessionId": "nobody", "success": false});
    assert!(events.contains(&aborted));

    let invalid: Vec<_> = events
        .iter()
        .filter(|event| {
            event["type"] == "error"
                && event["error"]
                    .as_str()
                    .is_some_and(|text| text.starts_with("Invalid request"))
        })
        .collect();
    assert_eq!(invalid.len(), 1);
    Ok(())
}

#[test]
fn serve_exits_cleanly_on_empty_input() -> Result<()> {
    let workspace = Workspace::new("")?;
    let output = Command::cargo_bin("codex-bridge")?
        .arg("--config")
        .arg(workspace.config())
        .arg("serve")
        .write_stdin("")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(output.is_empty());
    Ok(())
}
