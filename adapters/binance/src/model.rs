use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tradegate_core::utils::timestamp_to_datetime;
use tradegate_core::{Candle, OrderSide, Result, Symbol, Timeframe, Trade, TradeGateError};
use tradegate_exchange::{OrderTradeEvent, RateBudget};

fn decimal(field: &str, value: &str) -> Result<Decimal> {
    value
        .parse()
        .map_err(|e| TradeGateError::InvalidData(format!("Invalid decimal in {}: {:?} ({})", field, value, e)))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeInformation {
    pub rate_limits: Vec<RateLimit>,
    pub symbols: Vec<SymbolInformation>,
}

impl ExchangeInformation {
    /// Lowercase names of the symbols currently trading.
    pub fn trading_symbols(&self) -> Vec<Symbol> {
        self.symbols
            .iter()
            .filter(|s| s.status == "TRADING")
            .map(|s| Symbol::new(&s.symbol))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub rate_limit_type: String,
    pub interval: String,
    pub interval_num: u64,
    pub limit: u32,
}

impl RateLimit {
    /// Usage header reporting consumption against this limit, lowercase.
    pub fn header(&self) -> Result<String> {
        let prefix = match self.rate_limit_type.as_str() {
            "REQUEST_WEIGHT" => "x-mbx-used-weight-",
            "ORDERS" => "x-mbx-order-count-",
            other => {
                return Err(TradeGateError::RateLimitIntegrity(format!(
                    "Unrecognized exchange limit type: {}",
                    other
                )))
            }
        };
        let (unit, _) = self.unit()?;
        Ok(format!("{}{}{}", prefix, self.interval_num, unit))
    }

    pub fn window(&self) -> Result<Duration> {
        let (_, seconds) = self.unit()?;
        Ok(Duration::from_secs(self.interval_num * seconds))
    }

    fn unit(&self) -> Result<(char, u64)> {
        match self.interval.as_str() {
            "SECOND" => Ok(('s', 1)),
            "MINUTE" => Ok(('m', 60)),
            "HOUR" => Ok(('h', 3_600)),
            "DAY" => Ok(('d', 86_400)),
            other => Err(TradeGateError::RateLimitIntegrity(format!(
                "Unrecognized exchange limit interval: {}",
                other
            ))),
        }
    }
}

/// Maps the advertised limits to rate-limiter budgets keyed by header.
pub fn rate_budgets(limits: &[RateLimit]) -> Result<Vec<(String, RateBudget)>> {
    limits
        .iter()
        .map(|l| Ok((l.header()?, RateBudget::new(l.limit, l.window()?))))
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SymbolInformation {
    pub symbol: String,
    pub status: String,
}

/// One row of `GET klines`.
#[derive(Debug, Deserialize)]
pub struct RestKline(
    pub i64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub i64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub serde_json::Value,
);

impl RestKline {
    pub fn to_candle(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<Candle> {
        Ok(Candle {
            symbol: symbol.clone(),
            timeframe,
            open_time: timestamp_to_datetime(self.0),
            update_time: timestamp_to_datetime(self.6),
            open: decimal("open", &self.1)?,
            high: decimal("high", &self.2)?,
            low: decimal("low", &self.3)?,
            close: decimal("close", &self.4)?,
            volume: decimal("volume", &self.5)?,
            buy_volume: decimal("taker buy volume", &self.9)?,
            trades: self.8,
            closed: true,
        })
    }
}

/// Aggregate trade, as returned by `GET aggTrades` and the `aggTrade` stream.
#[derive(Debug, Deserialize)]
pub struct AggTrade {
    #[serde(rename = "a")]
    pub id: u64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Buyer was the maker, so the taker sold.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

impl AggTrade {
    pub fn to_trade(&self, symbol: &Symbol) -> Result<Trade> {
        Ok(Trade {
            symbol: symbol.clone(),
            id: self.id,
            time: timestamp_to_datetime(self.trade_time),
            price: decimal("price", &self.price)?,
            volume: decimal("quantity", &self.quantity)?,
            taker_buy: !self.buyer_is_maker,
        })
    }
}

/// Combined-stream wrapper: `{"stream": "...", "data": {...}}`.
#[derive(Debug, Deserialize)]
pub struct StreamEnvelope {
    pub stream: String,
    pub data: MarketPayload,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
pub enum MarketPayload {
    #[serde(rename = "kline")]
    Kline(WsKlineEvent),
    #[serde(rename = "aggTrade")]
    AggTrade(WsAggTradeEvent),
}

#[derive(Debug, Deserialize)]
pub struct WsKlineEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: WsKline,
}

#[derive(Debug, Deserialize)]
pub struct WsKline {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "n")]
    pub trades: u64,
    #[serde(rename = "x")]
    pub closed: bool,
    #[serde(rename = "V")]
    pub taker_buy_volume: String,
}

impl WsKlineEvent {
    pub fn to_candle(&self) -> Result<Candle> {
        let k = &self.kline;
        Ok(Candle {
            symbol: Symbol::new(&self.symbol),
            timeframe: k.interval.parse()?,
            open_time: timestamp_to_datetime(k.open_time),
            update_time: timestamp_to_datetime(self.event_time),
            open: decimal("open", &k.open)?,
            high: decimal("high", &k.high)?,
            low: decimal("low", &k.low)?,
            close: decimal("close", &k.close)?,
            volume: decimal("volume", &k.volume)?,
            buy_volume: decimal("taker buy volume", &k.taker_buy_volume)?,
            trades: k.trades,
            closed: k.closed,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct WsAggTradeEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(flatten)]
    pub trade: AggTrade,
}

/// User data stream events this gateway understands.
#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
pub enum UserPayload {
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTradeUpdate(WsOrderTradeUpdate),
    #[serde(rename = "listenKeyExpired")]
    ListenKeyExpired,
}

#[derive(Debug, Deserialize)]
pub struct WsOrderTradeUpdate {
    #[serde(rename = "T")]
    pub transaction_time: i64,
    #[serde(rename = "o")]
    pub order: WsOrder,
}

#[derive(Debug, Deserialize)]
pub struct WsOrder {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "f")]
    pub time_in_force: String,
    #[serde(rename = "q")]
    pub original_quantity: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "ap")]
    pub average_price: String,
    #[serde(rename = "sp")]
    pub stop_price: String,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "l")]
    pub last_filled_quantity: String,
    #[serde(rename = "z")]
    pub filled_quantity: String,
    #[serde(rename = "L")]
    pub last_price: String,
    #[serde(rename = "R", default)]
    pub reduce_only: bool,
}

impl WsOrderTradeUpdate {
    pub fn to_event(&self) -> Result<OrderTradeEvent> {
        let o = &self.order;
        let side = match o.side.as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            other => return Err(TradeGateError::InvalidData(format!("Unknown order side: {}", other))),
        };

        Ok(OrderTradeEvent {
            client_order_id: o.client_order_id.clone(),
            symbol: Symbol::new(&o.symbol),
            side,
            order_type: o.order_type.clone(),
            time_in_force: o.time_in_force.clone(),
            original_size: decimal("q", &o.original_quantity)?,
            price: decimal("p", &o.price)?,
            stop_price: decimal("sp", &o.stop_price)?,
            reduce_only: o.reduce_only,
            status: o.status.clone(),
            last_filled_size: decimal("l", &o.last_filled_quantity)?,
            filled_size: decimal("z", &o.filled_quantity)?,
            last_price: decimal("L", &o.last_price)?,
            average_price: decimal("ap", &o.average_price)?,
            time: timestamp_to_datetime(self.transaction_time),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKey {
    pub listen_key: String,
}
