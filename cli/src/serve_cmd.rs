use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use codex_bridge::Bridge;
use codex_bridge::BridgeEvent;
use codex_bridge::EventSink;
use codex_bridge::TurnRequest;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::output::write_events;

/// One line of the stdin protocol.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientRequest {
    Run(TurnRequest),
    #[serde(rename_all = "camelCase")]
    Abort { session_id: String },
}

pub(crate) async fn run(bridge: Arc<Bridge>) -> Result<()> {
    let (tx, rx) = async_channel::unbounded();
    let writer = tokio::spawn(write_events(rx, tokio::io::stdout()));
    let events = EventSink::new(tx);
    let mut turns = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read request")? else {
                    break;
                };
                handle_line(&bridge, &events, &mut turns, &line).await;
            }
            _ = tokio::signal::ctrl_c() => {
                let aborted = bridge.abort_all();
                info!(aborted, "interrupted, aborting running turns");
                break;
            }
            Some(joined) = turns.join_next(), if !turns.is_empty() => {
                if let Err(err) = joined {
                    warn!("turn task failed: {err}");
                }
            }
        }
    }

    while let Some(joined) = turns.join_next().await {
        if let Err(err) = joined {
            warn!("turn task failed: {err}");
        }
    }
    drop(events);
    writer.await.context("event writer panicked")?
}

async fn handle_line(
    bridge: &Arc<Bridge>,
    events: &EventSink,
    turns: &mut JoinSet<()>,
    line: &str,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let request = match serde_json::from_str::<ClientRequest>(line) {
        Ok(request) => request,
        Err(err) => {
            warn!("ignoring malformed request: {err}");
            events
                .send(BridgeEvent::error(format!("Invalid request: {err}")))
                .await;
            return;
        }
    };

    match request {
        ClientRequest::Run(turn) => {
            let bridge = Arc::clone(bridge);
            let events = events.clone();
            turns.spawn(async move {
                if let Err(err) = bridge.run_turn(turn, events).await {
                    debug!("turn ended with error: {err}");
                }
            });
        }
        ClientRequest::Abort { session_id } => {
            let success = bridge.abort(&session_id);
            events
                .send(BridgeEvent::SessionAborted {
                    session_id,
                    success,
                })
                .await;
        }
    }
}
