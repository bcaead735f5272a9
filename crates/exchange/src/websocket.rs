use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use tradegate_core::{Result, TradeGateError};
use url::Url;

use crate::traits::{FrameSink, FrameSource, WsConnector, WsSession};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    connect_timeout: Duration,
    read_idle_timeout: Option<Duration>,
}

impl TungsteniteConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_idle_timeout: None,
        }
    }

    /// Fails a socket with `ConnectionLost` once nothing, pings included,
    /// has arrived for `idle`. Zero disables the check.
    pub fn with_read_idle_timeout(mut self, idle: Duration) -> Self {
        self.read_idle_timeout = (!idle.is_zero()).then_some(idle);
        self
    }
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<WsSession> {
        let url = Url::parse(url)
            .map_err(|e| TradeGateError::WebSocket(format!("Invalid WebSocket URL: {}", e)))?;

        // The user socket path carries the session key, so only the host is logged.
        let host = url.host_str().unwrap_or_default().to_string();
        info!(host = %host, "Connecting to WebSocket");

        let (stream, response) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                TradeGateError::Timeout(format!(
                    "WebSocket connect to {} timed out after {:?}",
                    host, self.connect_timeout
                ))
            })?
            .map_err(|e| {
                error!(host = %host, error = %e, "Failed to connect to WebSocket");
                TradeGateError::WebSocket(format!("Connection failed: {}", e))
            })?;

        info!(host = %host, status = %response.status(), "WebSocket connected");

        let (write, read) = stream.split();
        Ok(WsSession {
            sink: Box::new(TungsteniteSink { write }),
            source: Box::new(TungsteniteSource {
                read,
                idle_timeout: self.read_idle_timeout,
            }),
        })
    }
}

struct TungsteniteSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        debug!(frame = %frame, "Sending WebSocket frame");
        self.write
            .send(Message::Text(frame))
            .await
            .map_err(|e| TradeGateError::WebSocket(format!("Failed to send message: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        match self.write.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TradeGateError::WebSocket(format!("Failed to close socket: {}", e))),
        }
    }
}

struct TungsteniteSource {
    read: SplitStream<WsStream>,
    idle_timeout: Option<Duration>,
}

impl TungsteniteSource {
    async fn recv(&mut self) -> Result<Option<std::result::Result<Message, WsError>>> {
        let Some(idle) = self.idle_timeout else {
            return Ok(self.read.next().await);
        };
        timeout(idle, self.read.next()).await.map_err(|_| {
            warn!(idle = ?idle, "WebSocket read idle timeout");
            TradeGateError::ConnectionLost(format!("no frames received for {:?}", idle))
        })
    }
}

#[async_trait]
impl FrameSource for TungsteniteSource {
    async fn next_frame(&mut self) -> Result<Option<String>> {
        while let Some(message) = self.recv().await? {
            match message {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Binary(data)) => {
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
                }
                // Pongs are answered by tungstenite on the next read or write.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    return match frame {
                        None => Ok(None),
                        Some(frame) if frame.code == CloseCode::Normal => Ok(None),
                        Some(frame) => {
                            warn!(code = ?frame.code, reason = %frame.reason, "WebSocket closed abnormally");
                            Err(TradeGateError::ConnectionLost(format!(
                                "closed with code {:?}: {}",
                                frame.code, frame.reason
                            )))
                        }
                    };
                }
                Err(WsError::ConnectionClosed) => return Ok(None),
                Err(e) => return Err(TradeGateError::ConnectionLost(e.to_string())),
            }
        }

        Ok(None)
    }
}
