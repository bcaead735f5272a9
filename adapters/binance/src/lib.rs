//! Binance USDⓈ-M futures gateway.
//!
//! Wire models, the market and user stream protocols, listen-key leasing
//! and the [`BinanceFutures`] facade that ties them to the shared
//! connection machinery in `tradegate-exchange`.

pub mod client;
pub mod model;
pub mod protocol;

pub use client::{order_params, BinanceFutures, CANDLE_BATCH, TRADE_BATCH};
pub use protocol::{BinanceMarketProtocol, BinanceSessionKeys, BinanceUserProtocol};
