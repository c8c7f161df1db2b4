use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use codex_bridge::Bridge;
use codex_bridge::BridgeConfig;
use codex_bridge::InMemorySessionStore;
use codex_bridge::JsonSessionStore;
use codex_bridge::SessionStore;
use tracing::debug;

mod output;
mod run_cmd;
mod serve_cmd;

pub use run_cmd::RunArgs;
pub use serve_cmd::ClientRequest;

/// Drives the Codex CLI one turn at a time and prints its output as
/// newline-delimited JSON events.
#[derive(Debug, Parser)]
#[command(name = "codex-bridge", version)]
pub struct Cli {
    /// TOML file with bridge settings. Defaults apply when omitted.
    #[arg(long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Persist session history as JSON files in this directory.
    #[arg(long = "sessions-dir", value_name = "DIR", global = true)]
    pub sessions_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a single turn and stream its events to stdout.
    Run(RunArgs),
    /// Read JSON requests from stdin and stream events to stdout.
    Serve,
}

/// Logs go to stderr; stdout carries events only.
pub fn setup_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(BridgeConfig::default()),
    }
}

fn build_bridge(cli: &Cli) -> Result<Arc<Bridge>> {
    let config = load_config(cli.config.as_ref())?;
    debug!(?config, "loaded bridge config");
    let store: Arc<dyn SessionStore> = match &cli.sessions_dir {
        Some(dir) => Arc::new(JsonSessionStore::new(dir.clone())),
        None => Arc::new(InMemorySessionStore::new()),
    };
    let bridge = Bridge::new(config, store).context("failed to initialise bridge")?;
    Ok(Arc::new(bridge))
}

pub async fn run_main(cli: Cli) -> Result<ExitCode> {
    let bridge = build_bridge(&cli)?;
    match cli.command {
        Command::Run(args) => run_cmd::run(bridge, args).await,
        Command::Serve => serve_cmd::run(bridge).await.map(|()| ExitCode::SUCCESS),
    }
}
