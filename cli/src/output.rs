use anyhow::Context;
use anyhow::Result;
use async_channel::Receiver;
use codex_bridge::BridgeEvent;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// Writes each event as one JSON line until every sender is gone.
pub(crate) async fn write_events<W>(rx: Receiver<BridgeEvent>, mut out: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Ok(event) = rx.recv().await {
        let mut line = serde_json::to_vec(&event).context("failed to encode event")?;
        line.push(b'\n');
        out.write_all(&line).await.context("failed to write event")?;
        out.flush().await.context("failed to flush event")?;
    }
    Ok(())
}
