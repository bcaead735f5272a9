use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tradegate_core::config::GatewayConfig;
use tradegate_core::utils::{datetime_to_timestamp, generate_client_order_id};
use tradegate_core::{
    Candle, HistoryCursor, MarketChannel, Order, OrderType, Result, Symbol, Timeframe, Trade, TradeGateError,
};
use tradegate_exchange::{
    CandleStream, MarketMultiplexer, MarketSnapshot, OrderCorrelator, OrderFilter, OrderUpdateStream,
    QueuePolicy, RestClientImpl, SessionKeyProvider, TradeStream, TungsteniteConnector, UserSnapshot,
    UserStreamManager, WsConnector,
};

use crate::model::{rate_budgets, AggTrade, ExchangeInformation, RestKline};
use crate::protocol::{BinanceMarketProtocol, BinanceSessionKeys, BinanceUserProtocol};

pub const CANDLE_BATCH: usize = 1500;
pub const TRADE_BATCH: usize = 1000;

/// Gateway to Binance USDⓈ-M futures.
///
/// Streams created here share one market socket and one user socket.
/// Construct inside a Tokio runtime; the connection actors are spawned
/// immediately but connect lazily when the first stream opens.
pub struct BinanceFutures {
    rest: Arc<RestClientImpl>,
    market: MarketMultiplexer,
    user: UserStreamManager,
    correlator: Arc<OrderCorrelator>,
    queue_policy: QueuePolicy,
    symbols: RwLock<Vec<Symbol>>,
}

impl BinanceFutures {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let connector = Arc::new(
            TungsteniteConnector::new(config.websocket.connect_timeout())
                .with_read_idle_timeout(config.websocket.read_idle_timeout()),
        );
        Self::with_parts(config, connector)
    }

    /// Uses `connector` for both sockets instead of a real WebSocket client.
    pub fn with_parts(config: GatewayConfig, connector: Arc<dyn WsConnector>) -> Result<Self> {
        config.validate()?;
        let rest = Arc::new(RestClientImpl::new(&config.rest, config.credentials.clone())?);
        let correlator = Arc::new(OrderCorrelator::new());

        let market = MarketMultiplexer::spawn(
            Arc::clone(&connector),
            Arc::new(BinanceMarketProtocol::new(&config.websocket.market_url)),
            config.websocket.control_interval(),
        );

        let keys: Arc<dyn SessionKeyProvider> = Arc::new(BinanceSessionKeys::new(Arc::clone(&rest)));
        let user = UserStreamManager::spawn(
            connector,
            Arc::new(BinanceUserProtocol::new(&config.websocket.user_url)),
            keys,
            Arc::clone(&correlator),
            config.user_stream.keepalive_interval(),
        );

        Ok(Self {
            rest,
            market,
            user,
            correlator,
            queue_policy: QueuePolicy::from_capacity(config.streams.queue_capacity),
            symbols: RwLock::new(Vec::new()),
        })
    }

    /// Loads trading symbols and the advertised rate limits.
    pub async fn open(&self) -> Result<()> {
        info!("Opening Binance futures gateway");
        let value = self.rest.execute(Method::GET, "exchangeInfo", &[], false).await?;
        let info: ExchangeInformation = serde_json::from_value(value)?;

        let budgets = rate_budgets(&info.rate_limits)?;
        for (header, budget) in &budgets {
            debug!(header = %header, limit = budget.limit, window_secs = budget.window.as_secs(), "Rate budget");
        }
        self.rest.rate_limiter().configure(budgets);

        let symbols = info.trading_symbols();
        info!(symbols = symbols.len(), "Exchange info loaded");
        *self.symbols.write() = symbols;
        Ok(())
    }

    /// Closes both sockets. Open streams end with `StreamEnded`.
    pub async fn close(&self) -> Result<()> {
        info!("Closing Binance futures gateway");
        self.market.shutdown().await?;
        self.user.shutdown().await?;
        Ok(())
    }

    /// Symbols in `TRADING` status as of the last `open`.
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.read().clone()
    }

    pub fn rest(&self) -> &Arc<RestClientImpl> {
        &self.rest
    }

    pub fn correlator(&self) -> &Arc<OrderCorrelator> {
        &self.correlator
    }

    pub async fn market_snapshot(&self) -> Result<MarketSnapshot> {
        self.market.snapshot().await
    }

    pub async fn user_snapshot(&self) -> Result<UserSnapshot> {
        self.user.snapshot().await
    }

    pub fn candle_stream<S: AsRef<str>>(&self, feeds: &[(S, Timeframe)]) -> CandleStream {
        let channels = feeds
            .iter()
            .map(|(symbol, timeframe)| MarketChannel::candles(Symbol::new(symbol), *timeframe))
            .collect();
        CandleStream::market(self.market.clone(), channels, self.queue_policy)
    }

    pub fn trade_stream<S: AsRef<str>>(&self, symbols: &[S]) -> TradeStream {
        let channels = symbols.iter().map(|s| MarketChannel::trades(Symbol::new(s))).collect();
        TradeStream::market(self.market.clone(), channels, self.queue_policy)
    }

    /// Updates for the given submitted orders only.
    pub fn order_update_stream(&self, orders: &[&Order]) -> Result<OrderUpdateStream> {
        let ids = orders
            .iter()
            .map(|o| {
                o.id.clone()
                    .ok_or_else(|| TradeGateError::InvalidOrder(format!("order was never submitted: {}", o)))
            })
            .collect::<Result<Vec<String>>>()?;
        Ok(OrderUpdateStream::user(
            self.user.clone(),
            OrderFilter::orders(ids),
            self.queue_policy,
        ))
    }

    /// Updates for every order on the account.
    pub fn all_order_updates(&self) -> OrderUpdateStream {
        OrderUpdateStream::user(self.user.clone(), OrderFilter::All, self.queue_policy)
    }

    /// Keeps `channels` subscribed even with no open stream.
    pub async fn persist_channels(&self, channels: Vec<MarketChannel>) -> Result<()> {
        self.market.persist(channels).await
    }

    /// Keeps the user socket open even with no open stream.
    pub async fn persist_order_updates(&self) -> Result<()> {
        self.user.persist().await
    }

    /// Assigns a client id to `order` and submits it. The returned handle is
    /// the one order updates will reference.
    pub async fn submit(&self, order: &mut Order) -> Result<Arc<Order>> {
        order.validate()?;
        if order.id.is_some() {
            return Err(TradeGateError::InvalidOrder(format!("order already submitted: {}", order)));
        }

        order.id = Some(generate_client_order_id());
        let submitted = Arc::new(order.clone());
        let id = client_id(&submitted)?;
        let params = order_params(&submitted)?;

        // Tracked before the call so an update racing the response is matched.
        self.correlator.track(Arc::clone(&submitted))?;
        info!(client_order_id = %id, order = %submitted, "Submitting order");

        if let Err(e) = self.rest.execute(Method::POST, "order", &params, true).await {
            warn!(client_order_id = %id, error = %e, "Order submission failed");
            self.correlator.untrack(&id);
            order.id = None;
            return Err(e);
        }
        Ok(submitted)
    }

    pub async fn cancel(&self, order: &Order) -> Result<()> {
        let id = order
            .id
            .clone()
            .ok_or_else(|| TradeGateError::InvalidOrder(format!("order was never submitted: {}", order)))?;

        info!(client_order_id = %id, "Cancelling order");
        let params = [
            ("symbol", order.symbol.to_exchange()),
            ("origClientOrderId", id),
        ];
        self.rest.execute(Method::DELETE, "order", &params, true).await?;
        Ok(())
    }

    /// Up to `count` closed candles starting at `start`, oldest first.
    pub async fn candle_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<Candle>> {
        let symbol = Symbol::new(symbol);
        info!(symbol = %symbol, timeframe = %timeframe, start = %start, count, "Fetching candle history");

        let mut candles: Vec<Candle> = Vec::with_capacity(count.min(CANDLE_BATCH));
        let mut start = start;
        while candles.len() < count {
            let limit = (count - candles.len()).min(CANDLE_BATCH);
            let params = [
                ("symbol", symbol.to_exchange()),
                ("interval", timeframe.to_string()),
                ("startTime", datetime_to_timestamp(start).to_string()),
                ("limit", limit.to_string()),
            ];

            let value = self.rest.execute(Method::GET, "klines", &params, false).await?;
            let rows: Vec<RestKline> = serde_json::from_value(value)?;
            debug!(start = %start, limit, received = rows.len(), "Candle batch");

            let received = rows.len();
            for row in rows.iter().take(count - candles.len()) {
                candles.push(row.to_candle(&symbol, timeframe)?);
            }

            match candles.last() {
                Some(last) if received == limit => start = last.open_time + ChronoDuration::milliseconds(1),
                _ => break,
            }
        }
        Ok(candles)
    }

    /// Up to `count` aggregate trades from `cursor`, oldest first.
    pub async fn trade_history(&self, symbol: &str, cursor: HistoryCursor, count: usize) -> Result<Vec<Trade>> {
        let symbol = Symbol::new(symbol);
        info!(symbol = %symbol, cursor = ?cursor, count, "Fetching trade history");

        let mut trades: Vec<Trade> = Vec::with_capacity(count.min(TRADE_BATCH));
        let mut cursor = cursor;
        while trades.len() < count {
            let limit = (count - trades.len()).min(TRADE_BATCH);
            let position = match cursor {
                HistoryCursor::Time(time) => ("startTime", datetime_to_timestamp(time).to_string()),
                HistoryCursor::Id(id) => ("fromId", id.to_string()),
            };
            let params = [
                ("symbol", symbol.to_exchange()),
                position,
                ("limit", limit.to_string()),
            ];

            let value = self.rest.execute(Method::GET, "aggTrades", &params, false).await?;
            let rows: Vec<AggTrade> = serde_json::from_value(value)?;
            debug!(cursor = ?cursor, limit, received = rows.len(), "Trade batch");

            let received = rows.len();
            for row in rows.iter().take(count - trades.len()) {
                trades.push(row.to_trade(&symbol)?);
            }

            match trades.last() {
                Some(last) if received == limit => cursor = HistoryCursor::Id(last.id + 1),
                _ => break,
            }
        }
        Ok(trades)
    }
}

fn client_id(order: &Order) -> Result<String> {
    order
        .id
        .clone()
        .ok_or_else(|| TradeGateError::Internal("submitted order lost its id".to_string()))
}

/// REST parameters for `POST order`.
pub fn order_params(order: &Order) -> Result<Vec<(&'static str, String)>> {
    let id = client_id(order)?;
    let mut params = vec![
        ("symbol", order.symbol.to_exchange()),
        ("side", order.side.as_exchange().to_string()),
        ("quantity", order.size.to_string()),
        ("newClientOrderId", id),
    ];

    match (order.order_type, order.stop_price) {
        (OrderType::Limit, None) => {
            let price = limit_price(order)?;
            params.push(("timeInForce", if order.post_only { "GTX" } else { "GTC" }.to_string()));
            params.push(("price", price));
            params.push(("type", "LIMIT".to_string()));
        }
        (OrderType::Limit, Some(stop)) => {
            params.push(("price", limit_price(order)?));
            params.push(("stopPrice", stop.to_string()));
            params.push(("type", "STOP".to_string()));
        }
        (OrderType::Market, None) => {
            params.push(("type", "MARKET".to_string()));
        }
        (OrderType::Market, Some(stop)) => {
            params.push(("stopPrice", stop.to_string()));
            params.push(("type", "STOP_MARKET".to_string()));
        }
    }

    if order.reduce_only {
        params.push(("reduceOnly", "true".to_string()));
    }
    Ok(params)
}

fn limit_price(order: &Order) -> Result<String> {
    order
        .price
        .map(|p| p.to_string())
        .ok_or_else(|| TradeGateError::InvalidOrder(format!("limit order without price: {}", order)))
}
