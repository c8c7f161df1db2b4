use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use codex_bridge::Attachment;
use codex_bridge::Bridge;
use codex_bridge::EventSink;
use codex_bridge::TurnOptions;
use codex_bridge::TurnRequest;
use tracing::info;
use tracing::warn;

use crate::output::write_events;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Project directory the turn runs in. Defaults to the current directory.
    #[arg(long = "cwd", value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    #[arg(long = "model", short = 'm')]
    pub model: Option<String>,

    #[arg(long = "reasoning-effort", value_name = "LEVEL")]
    pub reasoning_effort: Option<String>,

    /// Continue an existing session instead of starting a new one.
    #[arg(long = "session-id", value_name = "ID")]
    pub session_id: Option<String>,

    /// Pass `--dangerously-bypass-approvals-and-sandbox` to codex.
    #[arg(long = "skip-permissions", default_value_t = false)]
    pub skip_permissions: bool,

    /// Image to attach; may be repeated.
    #[arg(long = "image", value_name = "FILE")]
    pub images: Vec<PathBuf>,

    pub prompt: String,
}

impl RunArgs {
    fn into_request(self) -> Result<TurnRequest> {
        let images = self
            .images
            .iter()
            .map(PathBuf::as_path)
            .map(read_attachment)
            .collect::<Result<Vec<_>>>()?;
        Ok(TurnRequest {
            prompt: self.prompt,
            options: TurnOptions {
                session_id: self.session_id,
                cwd: self.cwd,
                model: self.model,
                reasoning_effort: self.reasoning_effort,
                skip_permissions: self.skip_permissions,
                images,
            },
        })
    }
}

fn read_attachment(path: &Path) -> Result<Attachment> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))?;
    Ok(Attachment::from_bytes(mime_for(path), &bytes))
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "image/png",
    }
}

pub(crate) async fn run(bridge: Arc<Bridge>, args: RunArgs) -> Result<ExitCode> {
    let request = args.into_request()?;
    let (tx, rx) = async_channel::unbounded();
    let writer = tokio::spawn(write_events(rx, tokio::io::stdout()));

    let turn = bridge.run_turn(request, EventSink::new(tx));
    tokio::pin!(turn);
    let result = tokio::select! {
        result = &mut turn => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, aborting turn");
            bridge.abort_all();
            turn.await
        }
    };

    writer.await.context("event writer panicked")??;

    Ok(match result {
        Ok(outcome) if outcome.success() => ExitCode::SUCCESS,
        Ok(outcome) => {
            warn!(exit_code = ?outcome.exit_code, "codex exited unsuccessfully");
            let code = outcome
                .exit_code
                .and_then(|code| u8::try_from(code).ok())
                .filter(|code| *code != 0)
                .unwrap_or(1);
            ExitCode::from(code)
        }
        Err(err) => {
            warn!("turn failed: {err}");
            ExitCode::FAILURE
        }
    })
}
