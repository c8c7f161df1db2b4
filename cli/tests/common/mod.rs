use std::path::PathBuf;

use anyhow::Result;
use tempfile::TempDir;

/// Scratch space with a fake codex script and a config file pointing at it.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new(script: &str) -> Result<Self> {
        let dir = TempDir::new()?;
        let script_path = dir.path().join("codex.js");
        std::fs::write(&script_path, script)?;
        std::fs::create_dir_all(dir.path().join("project"))?;
        let codex_path = script_path.display().to_string();
        std::fs::write(
            dir.path().join("bridge.toml"),
            format!("codex_path = {codex_path:?}\nnode_path = \"/bin/sh\"\nflush_interval_ms = 10\n"),
        )?;
        Ok(Self { dir })
    }

    pub fn config(&self) -> PathBuf {
        self.dir.path().join("bridge.toml")
    }

    pub fn project(&self) -> PathBuf {
        self.dir.path().join("project")
    }
}

pub fn parse_events(stdout: &[u8]) -> Result<Vec<serde_json::Value>, serde_json::Error> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}
