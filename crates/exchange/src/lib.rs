//! Connection multiplexing for exchange gateways.
//!
//! Market and user data streams share one socket per kind; REST calls go
//! through a signing executor governed by the exchange's own usage headers.

pub mod correlator;
pub mod keepalive;
pub mod market;
pub mod prelude;
pub mod queue;
pub mod rate_limiter;
pub mod rest;
pub mod stream;
pub mod traits;
pub mod user;
pub mod websocket;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use correlator::*;
pub use market::{ChannelSnapshot, ConnectionState, MarketMultiplexer, MarketSnapshot};
pub use queue::{QueuePolicy, Termination};
pub use rate_limiter::*;
pub use rest::*;
pub use stream::*;
pub use traits::*;
pub use user::{UserSnapshot, UserStreamManager};
pub use websocket::*;
