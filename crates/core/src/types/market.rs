use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TradeGateError;

/// Exchange symbol, kept in lowercase (the form WebSocket channels use).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self(symbol.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Uppercase form expected by REST endpoints.
    pub fn to_exchange(&self) -> String {
        self.0.to_uppercase()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
    Month1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 15] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::D3,
        Timeframe::W1,
        Timeframe::Month1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::D3 => "3d",
            Timeframe::W1 => "1w",
            Timeframe::Month1 => "1M",
        }
    }

    /// Nominal interval length. A month is counted as 30 days.
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M3 => Duration::minutes(3),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::M30 => Duration::minutes(30),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H2 => Duration::hours(2),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::H6 => Duration::hours(6),
            Timeframe::H8 => Duration::hours(8),
            Timeframe::H12 => Duration::hours(12),
            Timeframe::D1 => Duration::days(1),
            Timeframe::D3 => Duration::days(3),
            Timeframe::W1 => Duration::weeks(1),
            Timeframe::Month1 => Duration::days(30),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = TradeGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| TradeGateError::InvalidData(format!("Unknown timeframe: {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub buy_volume: Decimal,
    pub trades: u64,
    /// Streamed candles flip to closed exactly once per interval; history
    /// candles are always closed.
    pub closed: bool,
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, t:{}, o:{}, h:{}, l:{}, c:{}, v:{}",
            self.symbol, self.timeframe, self.open_time, self.open, self.high, self.low, self.close, self.volume
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    /// Exchange-assigned aggregate id, usable as a history cursor.
    pub id: u64,
    pub time: DateTime<Utc>,
    pub price: Decimal,
    pub volume: Decimal,
    pub taker_buy: bool,
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{} price:{}, volume:{}", self.symbol, self.id, self.price, self.volume)
    }
}

/// Logical market feed. The wire name is only produced at the socket boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MarketChannel {
    Candles { symbol: Symbol, timeframe: Timeframe },
    Trades { symbol: Symbol },
}

impl MarketChannel {
    pub fn candles(symbol: impl Into<Symbol>, timeframe: Timeframe) -> Self {
        MarketChannel::Candles { symbol: symbol.into(), timeframe }
    }

    pub fn trades(symbol: impl Into<Symbol>) -> Self {
        MarketChannel::Trades { symbol: symbol.into() }
    }

    pub fn symbol(&self) -> &Symbol {
        match self {
            MarketChannel::Candles { symbol, .. } | MarketChannel::Trades { symbol } => symbol,
        }
    }

    pub fn wire_name(&self) -> String {
        match self {
            MarketChannel::Candles { symbol, timeframe } => format!("{}@kline_{}", symbol, timeframe),
            MarketChannel::Trades { symbol } => format!("{}@aggTrade", symbol),
        }
    }
}

impl fmt::Display for MarketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

impl FromStr for MarketChannel {
    type Err = TradeGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (symbol, feed) = s
            .split_once('@')
            .ok_or_else(|| TradeGateError::InvalidData(format!("Malformed channel name: {}", s)))?;

        if feed == "aggTrade" {
            return Ok(MarketChannel::trades(symbol));
        }

        match feed.strip_prefix("kline_") {
            Some(tf) => Ok(MarketChannel::candles(symbol, tf.parse()?)),
            None => Err(TradeGateError::InvalidData(format!("Unknown channel feed: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Candle(Candle),
    Trade(Trade),
}

/// Resumption point for paginated trade history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryCursor {
    Time(DateTime<Utc>),
    Id(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_normalization() {
        let symbol = Symbol::new("BTCUSDT");
        assert_eq!(symbol.as_str(), "btcusdt");
        assert_eq!(symbol.to_exchange(), "BTCUSDT");
    }

    #[test]
    fn test_timeframe_parsing() {
        assert_eq!("3m".parse::<Timeframe>().unwrap(), Timeframe::M3);
        assert_eq!("1M".parse::<Timeframe>().unwrap(), Timeframe::Month1);
        assert_eq!(Timeframe::H4.to_string(), "4h");
        assert!("7m".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::M15.duration(), Duration::minutes(15));
    }

    #[test]
    fn test_channel_wire_names() {
        let candles = MarketChannel::candles("BTCUSDT", Timeframe::M3);
        assert_eq!(candles.wire_name(), "btcusdt@kline_3m");

        let trades = MarketChannel::trades("ethusdt");
        assert_eq!(trades.wire_name(), "ethusdt@aggTrade");

        assert_eq!("btcusdt@kline_3m".parse::<MarketChannel>().unwrap(), candles);
        assert_eq!("ethusdt@aggTrade".parse::<MarketChannel>().unwrap(), trades);
    }

    #[test]
    fn test_channel_parse_rejects_unknown_feeds() {
        assert!("btcusdt".parse::<MarketChannel>().is_err());
        assert!("btcusdt@depth".parse::<MarketChannel>().is_err());
        assert!("btcusdt@kline_9m".parse::<MarketChannel>().is_err());
    }
}
