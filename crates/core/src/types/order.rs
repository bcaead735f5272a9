use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::Symbol;
use crate::error::{Result, TradeGateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_exchange(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Stop variants are not separate types: an order with a `stop_price` is a
/// stop order of its base type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Limit => write!(f, "limit"),
            OrderType::Market => write!(f, "market"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Submit,
    Partial,
    Fill,
    Cancel,
    Expire,
    /// Exchange status with no canonical mapping, kept verbatim.
    Other(String),
}

impl OrderStatus {
    pub fn from_exchange(status: &str) -> Self {
        match status {
            "NEW" => OrderStatus::Submit,
            "PARTIALLY_FILLED" => OrderStatus::Partial,
            "FILLED" => OrderStatus::Fill,
            "CANCELED" => OrderStatus::Cancel,
            "EXPIRED" => OrderStatus::Expire,
            other => OrderStatus::Other(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Fill | OrderStatus::Cancel | OrderStatus::Expire)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Submit => write!(f, "submit"),
            OrderStatus::Partial => write!(f, "partial"),
            OrderStatus::Fill => write!(f, "fill"),
            OrderStatus::Cancel => write!(f, "cancel"),
            OrderStatus::Expire => write!(f, "expire"),
            OrderStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub symbol: Symbol,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub size: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub post_only: bool,
    /// Client order id, assigned when the order is submitted.
    pub id: Option<String>,
}

impl Order {
    pub fn new_market(symbol: impl Into<Symbol>, side: OrderSide, size: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            order_type: OrderType::Market,
            side,
            size,
            price: None,
            stop_price: None,
            reduce_only: false,
            post_only: false,
            id: None,
        }
    }

    pub fn new_limit(symbol: impl Into<Symbol>, side: OrderSide, size: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            order_type: OrderType::Limit,
            side,
            size,
            price: Some(price),
            stop_price: None,
            reduce_only: false,
            post_only: false,
            id: None,
        }
    }

    pub fn with_stop(mut self, stop_price: Decimal) -> Self {
        self.stop_price = Some(stop_price);
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn post_only(mut self) -> Self {
        self.post_only = true;
        self
    }

    pub fn is_stop(&self) -> bool {
        self.stop_price.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.size <= Decimal::ZERO {
            return Err(TradeGateError::InvalidOrder(format!(
                "Order size must be positive, got {}",
                self.size
            )));
        }

        if self.order_type == OrderType::Limit && self.price.is_none() {
            return Err(TradeGateError::InvalidOrder(
                "Limit order requires a price".to_string(),
            ));
        }

        if let Some(stop) = self.stop_price {
            if stop <= Decimal::ZERO {
                return Err(TradeGateError::InvalidOrder(format!(
                    "Stop price must be positive, got {}",
                    stop
                )));
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {} {}", self.symbol, self.order_type, self.side, self.size)?;
        if let Some(price) = self.price {
            write!(f, " @ {}", price)?;
        }
        if let Some(stop) = self.stop_price {
            write!(f, " stop {}", stop)?;
        }
        if let Some(id) = &self.id {
            write!(f, " [{}]", id)?;
        }
        Ok(())
    }
}

/// One exchange event for an order. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub order: Arc<Order>,
    pub time: DateTime<Utc>,
    pub status: OrderStatus,
    /// Size filled by this event.
    pub size: Decimal,
    /// Cumulative filled size.
    pub total_size: Decimal,
    pub price: Decimal,
    pub average_price: Decimal,
}

impl std::fmt::Display for OrderUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} size:{} total:{} price:{} avg:{}",
            self.order, self.status, self.size, self.total_size, self.price, self.average_price
        )
    }
}
