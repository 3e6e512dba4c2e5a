//! WebSocket client transport.
//!
//! Connects with `tokio-tungstenite` and splits the stream so sends and the
//! receive loop do not contend for one lock. Ping/pong control frames are
//! answered by the library while reading and never surface as frames.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::error::TransportError;

use super::{Result, Transport, TransportType};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client transport for `ws://` and `wss://` URLs.
pub struct WebSocketTransport {
    url: String,
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: Mutex<Option<SplitStream<WsStream>>>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Creates an unopened transport for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    /// Server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<()> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {e}", self.url)))?;
        let (writer, reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
        debug!(url = %self.url, "websocket opened");
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        writer.send(Message::Text(text.to_owned())).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<String>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(e) => warn!(error = %e, "dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "close frame received");
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                ))
                | None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        }
        // The receive loop may still hold the reader; it observes the close
        // on its next read.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        Ok(())
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}
