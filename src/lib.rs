pub use tradegate_core::prelude::*;
pub use tradegate_exchange::prelude::*;
pub use tradegate_monitoring::prelude::*;

// Re-export exchange adapters
pub use tradegate_binance::{BinanceFutures, BinanceMarketProtocol, BinanceSessionKeys, BinanceUserProtocol};

