//! Prelude module for tradegate-exchange
//!
//! Re-exports commonly used types and traits

pub use crate::correlator::{OrderCorrelator, OrderFilter};
pub use crate::market::{ConnectionState, MarketMultiplexer};
pub use crate::queue::QueuePolicy;
pub use crate::stream::{
    AnyStream, CandleStream, MixedItem, MixedStream, OrderUpdateStream, Stream, TradeStream,
};
pub use crate::traits::{MarketProtocol, SessionKeyProvider, UserProtocol, WsConnector};
pub use crate::user::UserStreamManager;

pub use tradegate_core::prelude::*;
