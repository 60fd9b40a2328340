use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitStream, SinkExt, StreamExt};
use shared::protocol::RealtimeFrame;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::error::SyncError;

const OUTBOUND_BUFFER: usize = 64;

pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Outbound half of the realtime channel.
#[async_trait]
pub trait RealtimeLink: Send + Sync {
    async fn publish(&self, frame: RealtimeFrame) -> Result<()>;
}

/// Link used while offline; frames go nowhere.
pub struct NullLink;

#[async_trait]
impl RealtimeLink for NullLink {
    async fn publish(&self, _frame: RealtimeFrame) -> Result<()> {
        Ok(())
    }
}

pub struct WsLink {
    tx: mpsc::Sender<RealtimeFrame>,
}

impl WsLink {
    /// Opens the socket and spawns the writer task. The returned reader is the
    /// inbound half for the caller to drain.
    pub async fn connect(server_url: &str) -> Result<(Self, WsReader), SyncError> {
        let ws_url = websocket_url(server_url)?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))
            .map_err(SyncError::Link)?;
        let (mut writer, reader) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<RealtimeFrame>(OUTBOUND_BUFFER);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(v) => v,
                    Err(error) => {
                        warn!(%error, kind = frame.kind(), "failed to encode realtime frame");
                        continue;
                    }
                };
                if writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        Ok((Self { tx }, reader))
    }
}

#[async_trait]
impl RealtimeLink for WsLink {
    async fn publish(&self, frame: RealtimeFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| anyhow!("realtime connection is closed"))
    }
}

pub fn websocket_url(server_url: &str) -> Result<String, SyncError> {
    let server_url = server_url.trim_end_matches('/');
    let ws_url = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(SyncError::InvalidServerUrl(server_url.to_string()));
    };
    Ok(format!("{ws_url}/ws"))
}
