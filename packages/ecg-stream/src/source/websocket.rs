// WebSocket transport
//
// Text frames are forwarded verbatim; binary frames are forwarded as bytes
// and left to the normalizer. A close frame ends the stream normally, a
// socket error ends it as a transport failure.

use super::{RawMessage, SourceMetadata, StreamSource};
use crate::types::{PipelineError, StreamResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketStreamSource {
    url: String,
    stream: Option<WsStream>,
}

impl WebSocketStreamSource {
    pub fn new(url: String) -> Self {
        Self { url, stream: None }
    }
}

#[async_trait]
impl StreamSource for WebSocketStreamSource {
    async fn connect(&mut self) -> StreamResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        log::info!("Connecting to WebSocket: {}", self.url);
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| PipelineError::WebSocket(format!("Connection failed: {}", e)))?;
        log::info!("WebSocket connected");

        self.stream = Some(stream);
        Ok(())
    }

    async fn start(&mut self, sender: mpsc::Sender<RawMessage>) -> StreamResult<()> {
        if self.stream.is_none() {
            self.connect().await?;
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PipelineError::Connection("WebSocket not connected".to_string()))?;

        while let Some(message) = stream.next().await {
            let raw = match message {
                Ok(Message::Text(text)) => RawMessage::Text(text.as_str().to_string()),
                Ok(Message::Binary(data)) => RawMessage::Binary(data.to_vec()),
                Ok(Message::Close(_)) => {
                    log::info!("WebSocket closed by server");
                    self.stream = None;
                    return Ok(());
                }
                // Ping/pong are answered by tungstenite
                Ok(_) => continue,
                Err(e) => {
                    self.stream = None;
                    return Err(PipelineError::TransportFailure(format!(
                        "WebSocket error: {}",
                        e
                    )));
                }
            };

            if sender.send(raw).await.is_err() {
                log::warn!("Message receiver closed, stopping WebSocket stream");
                return Ok(());
            }
        }

        self.stream = None;
        Err(PipelineError::TransportFailure(
            "WebSocket stream ended without close frame".to_string(),
        ))
    }

    async fn stop(&mut self) -> StreamResult<()> {
        log::info!("Stopping WebSocket stream");
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                log::debug!("WebSocket close failed: {}", e);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            source_type: "websocket".to_string(),
            lead_count: None,
            properties: [("url".to_string(), self.url.clone())].into_iter().collect(),
        }
    }
}
