use async_trait::async_trait;
use tradegate_core::{MarketChannel, MarketEvent, Result};

use crate::correlator::OrderTradeEvent;

/// Write half of a WebSocket session.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a WebSocket session.
#[async_trait]
pub trait FrameSource: Send {
    /// `Ok(None)` means the peer closed the socket cleanly. Any error means
    /// the connection was lost.
    async fn next_frame(&mut self) -> Result<Option<String>>;
}

pub struct WsSession {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<WsSession>;
}

/// Exchange-specific encoding of the market connection. Channel wire names
/// only exist on this side of the seam.
pub trait MarketProtocol: Send + Sync {
    /// URL that opens the socket already subscribed to `channels`.
    fn connect_url(&self, channels: &[MarketChannel]) -> String;
    fn subscribe_frame(&self, channels: &[MarketChannel]) -> String;
    fn unsubscribe_frame(&self, channels: &[MarketChannel]) -> String;
    /// `None` for frames that carry no market data (acks, unknown shapes).
    fn decode(&self, frame: &str) -> Option<(MarketChannel, MarketEvent)>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    OrderTradeUpdate(OrderTradeEvent),
    /// The server invalidated the session key; the socket is no longer usable.
    SessionExpired,
}

pub trait UserProtocol: Send + Sync {
    fn connect_url(&self, session_key: &str) -> String;
    fn decode(&self, frame: &str) -> Option<UserEvent>;
}

/// Leases the credential that gates the user data socket.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionKeyProvider: Send + Sync {
    async fn create(&self) -> Result<String>;
    async fn refresh(&self, key: &str) -> Result<()>;
    async fn release(&self, key: &str) -> Result<()>;
}
