use std::process::ExitCode;

use clap::Parser;
use codex_bridge_cli::Cli;
use codex_bridge_cli::run_main;
use codex_bridge_cli::setup_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    setup_tracing();
    run_main(cli).await
}
