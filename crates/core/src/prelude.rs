//! Prelude module - re-exports commonly used types for convenience

pub use crate::config::{Credentials, GatewayConfig};
pub use crate::error::{Result, TradeGateError};
pub use crate::types::{market::*, order::*};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use rust_decimal::Decimal;
