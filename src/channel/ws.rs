use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use super::{ChannelError, Connector, FrameStream};

/// Websocket transport. Sends the subscribe handshake on open and yields
/// text frames; binary, ping and pong frames are skipped.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, execution_id: &str) -> Result<FrameStream, ChannelError> {
        let connect_err = |reason: String| ChannelError::Connect {
            url: self.url.clone(),
            reason,
        };

        let (mut ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        let hello = json!({ "type": "subscribe", "execution_id": execution_id }).to_string();
        ws.send(Message::Text(hello.into()))
            .await
            .map_err(|e| connect_err(format!("subscribe failed: {}", e)))?;
        info!(url = %self.url, %execution_id, "subscribed to live updates");

        let frames = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "live channel close frame");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Transport(e.to_string()))),
            }
        });
        Ok(frames.boxed())
    }
}
