//! In-memory sockets, protocols and session keys for exercising the
//! connection actors without a network.

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tradegate_core::{Candle, MarketChannel, MarketEvent, OrderSide, Result, Trade, TradeGateError};

use crate::correlator::OrderTradeEvent;
use crate::traits::{
    FrameSink, FrameSource, MarketProtocol, SessionKeyProvider, UserEvent, UserProtocol, WsConnector, WsSession,
};

enum MockFrame {
    Text(String),
    Close,
    Fail(String),
}

struct SessionState {
    url: String,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    frames: mpsc::UnboundedSender<MockFrame>,
}

/// Server side of one mocked socket.
#[derive(Clone)]
pub struct MockSession {
    state: Arc<SessionState>,
}

impl MockSession {
    pub fn url(&self) -> &str {
        &self.state.url
    }

    /// Frames the client sent, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state.sent.lock().clone()
    }

    /// Whether the client closed its write half.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.state.frames.send(MockFrame::Text(frame.into()));
    }

    pub fn close_cleanly(&self) {
        let _ = self.state.frames.send(MockFrame::Close);
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.state.frames.send(MockFrame::Fail(reason.to_string()));
    }

    /// Makes every later client send fail.
    pub fn fail_sends(&self) {
        self.state.fail_sends.store(true, Ordering::SeqCst);
    }
}

struct MockSink {
    state: Arc<SessionState>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        if self.state.fail_sends.load(Ordering::SeqCst) || self.state.closed.load(Ordering::SeqCst) {
            return Err(TradeGateError::ConnectionLost("mock send failed".to_string()));
        }
        self.state.sent.lock().push(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockSource {
    frames: mpsc::UnboundedReceiver<MockFrame>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn next_frame(&mut self) -> Result<Option<String>> {
        match self.frames.recv().await {
            Some(MockFrame::Text(frame)) => Ok(Some(frame)),
            Some(MockFrame::Close) | None => Ok(None),
            Some(MockFrame::Fail(reason)) => Err(TradeGateError::ConnectionLost(reason)),
        }
    }
}

#[derive(Default)]
struct ConnectorState {
    sessions: Vec<MockSession>,
    urls: Vec<String>,
    fail_next: bool,
}

/// Connector that hands out in-memory sessions and records every URL.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_connect(&self) {
        self.state.lock().fail_next = true;
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// URLs of every connect attempt, failed ones included.
    pub fn urls(&self) -> Vec<String> {
        self.state.lock().urls.clone()
    }

    pub fn session(&self, index: usize) -> Option<MockSession> {
        self.state.lock().sessions.get(index).cloned()
    }

    pub fn last_session(&self) -> Option<MockSession> {
        self.state.lock().sessions.last().cloned()
    }
}

#[async_trait]
impl WsConnector for MockConnector {
    async fn connect(&self, url: &str) -> Result<WsSession> {
        let mut state = self.state.lock();
        state.urls.push(url.to_string());
        if std::mem::take(&mut state.fail_next) {
            return Err(TradeGateError::WebSocket("mock connect refused".to_string()));
        }

        let (frames, receiver) = mpsc::unbounded_channel();
        let session = Arc::new(SessionState {
            url: url.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            frames,
        });
        state.sessions.push(MockSession {
            state: Arc::clone(&session),
        });

        Ok(WsSession {
            sink: Box::new(MockSink { state: session }),
            source: Box::new(MockSource { frames: receiver }),
        })
    }
}

/// Plain-text market protocol: control frames look like
/// `SUBSCRIBE a,b #1` and data frames like `btcusdt@aggTrade 7`.
#[derive(Debug, Default)]
pub struct TestMarketProtocol {
    next_id: AtomicU64,
}

impl TestMarketProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn control(&self, method: &str, channels: &[MarketChannel]) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{} {} #{}", method, wire_names(channels).join(","), id)
    }
}

fn wire_names(channels: &[MarketChannel]) -> Vec<String> {
    channels.iter().map(MarketChannel::wire_name).collect()
}

/// Data frame carrying sequence number `seq` on `channel`.
pub fn market_frame(channel: &MarketChannel, seq: u64) -> String {
    format!("{} {}", channel.wire_name(), seq)
}

impl MarketProtocol for TestMarketProtocol {
    fn connect_url(&self, channels: &[MarketChannel]) -> String {
        format!("mock://market?streams={}", wire_names(channels).join("/"))
    }

    fn subscribe_frame(&self, channels: &[MarketChannel]) -> String {
        self.control("SUBSCRIBE", channels)
    }

    fn unsubscribe_frame(&self, channels: &[MarketChannel]) -> String {
        self.control("UNSUBSCRIBE", channels)
    }

    fn decode(&self, frame: &str) -> Option<(MarketChannel, MarketEvent)> {
        let (name, seq) = frame.split_once(' ')?;
        let channel: MarketChannel = name.parse().ok()?;
        let seq: u64 = seq.parse().ok()?;
        let time = DateTime::from_timestamp_millis(1_700_000_000_000 + seq as i64)?;

        let event = match &channel {
            MarketChannel::Candles { symbol, timeframe } => MarketEvent::Candle(Candle {
                symbol: symbol.clone(),
                timeframe: *timeframe,
                open_time: time,
                update_time: time,
                open: Decimal::ONE,
                high: Decimal::ONE,
                low: Decimal::ONE,
                close: Decimal::ONE,
                volume: Decimal::ZERO,
                buy_volume: Decimal::ZERO,
                trades: seq,
                closed: false,
            }),
            MarketChannel::Trades { symbol } => MarketEvent::Trade(Trade {
                symbol: symbol.clone(),
                id: seq,
                time,
                price: Decimal::ONE,
                volume: Decimal::ONE,
                taker_buy: seq % 2 == 0,
            }),
        };
        Some((channel, event))
    }
}

/// User protocol counterpart: `ORDER <client id> <status>` and `EXPIRED`.
#[derive(Debug, Default)]
pub struct TestUserProtocol;

pub fn order_frame(client_order_id: &str, status: &str) -> String {
    format!("ORDER {} {}", client_order_id, status)
}

pub fn expired_frame() -> String {
    "EXPIRED".to_string()
}

impl UserProtocol for TestUserProtocol {
    fn connect_url(&self, session_key: &str) -> String {
        format!("mock://user/{}", session_key)
    }

    fn decode(&self, frame: &str) -> Option<UserEvent> {
        if frame == "EXPIRED" {
            return Some(UserEvent::SessionExpired);
        }
        let mut parts = frame.strip_prefix("ORDER ")?.split(' ');
        let client_order_id = parts.next()?.to_string();
        let status = parts.next()?.to_string();

        Some(UserEvent::OrderTradeUpdate(OrderTradeEvent {
            client_order_id,
            symbol: "btcusdt".into(),
            side: OrderSide::Buy,
            order_type: "LIMIT".to_string(),
            time_in_force: "GTC".to_string(),
            original_size: Decimal::ONE,
            price: Decimal::ONE_HUNDRED,
            stop_price: Decimal::ZERO,
            reduce_only: false,
            status,
            last_filled_size: Decimal::ZERO,
            filled_size: Decimal::ZERO,
            last_price: Decimal::ZERO,
            average_price: Decimal::ZERO,
            time: DateTime::from_timestamp_millis(1_700_000_000_000)?,
        }))
    }
}

/// Session keys `key-1`, `key-2`, ... with every call recorded.
#[derive(Debug, Default)]
pub struct RecordingSessionKeys {
    created: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    refresh_attempts: AtomicUsize,
    refreshes: AtomicUsize,
    fail_next_create: AtomicBool,
    fail_refreshes: AtomicBool,
}

impl RecordingSessionKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_refreshes(&self, fail: bool) {
        self.fail_refreshes.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    /// Successful refreshes.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn refresh_attempts(&self) -> usize {
        self.refresh_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionKeyProvider for RecordingSessionKeys {
    async fn create(&self) -> Result<String> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(TradeGateError::Request {
                status: 401,
                body: r#"{"code":-2015,"msg":"Invalid API-key"}"#.to_string(),
            });
        }
        let mut created = self.created.lock();
        let key = format!("key-{}", created.len() + 1);
        created.push(key.clone());
        Ok(key)
    }

    async fn refresh(&self, _key: &str) -> Result<()> {
        self.refresh_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_refreshes.load(Ordering::SeqCst) {
            return Err(TradeGateError::Request {
                status: 400,
                body: r#"{"code":-1125,"msg":"This listenKey does not exist."}"#.to_string(),
            });
        }
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.released.lock().push(key.to_string());
        Ok(())
    }
}
