use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use tradegate_core::{MarketChannel, MarketEvent, Result};
use tradegate_exchange::{MarketProtocol, RestClientImpl, SessionKeyProvider, UserEvent, UserProtocol};

use crate::model::{ListenKey, MarketPayload, StreamEnvelope, UserPayload};

const LISTEN_KEY_ENDPOINT: &str = "listenKey";

/// Combined market stream encoding for USDⓈ-M futures.
#[derive(Debug)]
pub struct BinanceMarketProtocol {
    stream_url: String,
    next_request_id: AtomicU64,
}

impl BinanceMarketProtocol {
    /// `stream_url` is the combined-stream endpoint, e.g.
    /// `wss://fstream.binance.com/stream`.
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            next_request_id: AtomicU64::new(1),
        }
    }

    fn control_frame(&self, method: &str, channels: &[MarketChannel]) -> String {
        let params: Vec<String> = channels.iter().map(MarketChannel::wire_name).collect();
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        json!({ "method": method, "params": params, "id": id }).to_string()
    }
}

impl MarketProtocol for BinanceMarketProtocol {
    fn connect_url(&self, channels: &[MarketChannel]) -> String {
        let names: Vec<String> = channels.iter().map(MarketChannel::wire_name).collect();
        format!("{}?streams={}", self.stream_url, names.join("/"))
    }

    fn subscribe_frame(&self, channels: &[MarketChannel]) -> String {
        self.control_frame("SUBSCRIBE", channels)
    }

    fn unsubscribe_frame(&self, channels: &[MarketChannel]) -> String {
        self.control_frame("UNSUBSCRIBE", channels)
    }

    fn decode(&self, frame: &str) -> Option<(MarketChannel, MarketEvent)> {
        // Subscription acks ({"result":null,"id":1}) carry no stream field.
        let envelope: StreamEnvelope = serde_json::from_str(frame).ok()?;
        let channel: MarketChannel = envelope.stream.parse().ok()?;

        let event = match &envelope.data {
            MarketPayload::Kline(kline) => kline.to_candle().map(MarketEvent::Candle),
            MarketPayload::AggTrade(trade) => trade.trade.to_trade(channel.symbol()).map(MarketEvent::Trade),
        };

        match event {
            Ok(event) => Some((channel, event)),
            Err(e) => {
                warn!(stream = %envelope.stream, error = %e, "Malformed market event");
                None
            }
        }
    }
}

/// Raw user stream encoding: the session key is the last path segment.
#[derive(Debug)]
pub struct BinanceUserProtocol {
    base_url: String,
}

impl BinanceUserProtocol {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl UserProtocol for BinanceUserProtocol {
    fn connect_url(&self, session_key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), session_key)
    }

    fn decode(&self, frame: &str) -> Option<UserEvent> {
        // Account and margin events are not modeled.
        let payload: UserPayload = serde_json::from_str(frame).ok()?;
        match payload {
            UserPayload::OrderTradeUpdate(update) => match update.to_event() {
                Ok(event) => Some(UserEvent::OrderTradeUpdate(event)),
                Err(e) => {
                    warn!(error = %e, "Malformed order trade update");
                    None
                }
            },
            UserPayload::ListenKeyExpired => Some(UserEvent::SessionExpired),
        }
    }
}

/// Listen keys leased through signed REST calls.
#[derive(Debug, Clone)]
pub struct BinanceSessionKeys {
    rest: Arc<RestClientImpl>,
}

impl BinanceSessionKeys {
    pub fn new(rest: Arc<RestClientImpl>) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl SessionKeyProvider for BinanceSessionKeys {
    async fn create(&self) -> Result<String> {
        let value = self.rest.execute(Method::POST, LISTEN_KEY_ENDPOINT, &[], true).await?;
        let key: ListenKey = serde_json::from_value(value)?;
        debug!("Listen key created");
        Ok(key.listen_key)
    }

    // The account has a single listen key, so the key itself is not sent.
    async fn refresh(&self, _key: &str) -> Result<()> {
        self.rest.execute(Method::PUT, LISTEN_KEY_ENDPOINT, &[], true).await?;
        Ok(())
    }

    async fn release(&self, _key: &str) -> Result<()> {
        self.rest.execute(Method::DELETE, LISTEN_KEY_ENDPOINT, &[], true).await?;
        debug!("Listen key released");
        Ok(())
    }
}
