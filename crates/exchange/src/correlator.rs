use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use tradegate_core::{Order, OrderSide, OrderStatus, OrderType, OrderUpdate, Result, Symbol, TradeGateError};

const DEFAULT_RETIRED_CAPACITY: usize = 1024;

/// Decoded order-trade-update event, before correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTradeEvent {
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    /// Exchange order type as sent on the wire, e.g. `LIMIT` or `STOP_MARKET`.
    pub order_type: String,
    pub time_in_force: String,
    pub original_size: Decimal,
    pub price: Decimal,
    pub stop_price: Decimal,
    pub reduce_only: bool,
    /// Exchange execution status, e.g. `PARTIALLY_FILLED`.
    pub status: String,
    pub last_filled_size: Decimal,
    pub filled_size: Decimal,
    pub last_price: Decimal,
    pub average_price: Decimal,
    pub time: DateTime<Utc>,
}

impl OrderTradeEvent {
    /// Best-effort order for events about orders this process never submitted.
    pub fn to_order(&self) -> Order {
        let order_type = match self.order_type.as_str() {
            "LIMIT" | "STOP" | "TAKE_PROFIT" => OrderType::Limit,
            _ => OrderType::Market,
        };

        Order {
            symbol: self.symbol.clone(),
            order_type,
            side: self.side,
            size: self.original_size,
            price: (order_type == OrderType::Limit).then_some(self.price),
            stop_price: (!self.stop_price.is_zero()).then_some(self.stop_price),
            reduce_only: self.reduce_only,
            post_only: self.time_in_force == "GTX",
            id: Some(self.client_order_id.clone()),
        }
    }
}

/// Which order updates a consumer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderFilter {
    /// Every order on the account, including ones submitted elsewhere.
    All,
    /// Only these locally submitted orders.
    Orders(HashSet<String>),
}

impl OrderFilter {
    pub fn orders<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        OrderFilter::Orders(ids.into_iter().map(Into::into).collect())
    }

    /// `tracked` is whether the id belongs to a live locally submitted order.
    pub fn matches(&self, client_order_id: &str, tracked: bool) -> bool {
        match self {
            OrderFilter::All => true,
            OrderFilter::Orders(ids) => tracked && ids.contains(client_order_id),
        }
    }
}

/// Outcome of correlating one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    pub update: OrderUpdate,
    pub tracked: bool,
}

#[derive(Debug)]
struct CorrelatorState {
    live: HashMap<String, Arc<Order>>,
    retired: VecDeque<String>,
    retired_ids: HashSet<String>,
    retired_capacity: usize,
}

impl CorrelatorState {
    fn retire(&mut self, id: &str) {
        self.live.remove(id);
        if self.retired_ids.insert(id.to_string()) {
            self.retired.push_back(id.to_string());
            while self.retired.len() > self.retired_capacity {
                if let Some(oldest) = self.retired.pop_front() {
                    self.retired_ids.remove(&oldest);
                }
            }
        }
    }
}

/// Maps client order ids to the orders submitted under them and turns raw
/// order events into [`OrderUpdate`]s.
#[derive(Debug)]
pub struct OrderCorrelator {
    state: Mutex<CorrelatorState>,
}

impl Default for OrderCorrelator {
    fn default() -> Self {
        Self::with_retired_capacity(DEFAULT_RETIRED_CAPACITY)
    }
}

impl OrderCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `capacity` bounds how many retired ids are remembered.
    pub fn with_retired_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CorrelatorState {
                live: HashMap::new(),
                retired: VecDeque::new(),
                retired_ids: HashSet::new(),
                retired_capacity: capacity.max(1),
            }),
        }
    }

    pub fn track(&self, order: Arc<Order>) -> Result<()> {
        let id = order
            .id
            .clone()
            .ok_or_else(|| TradeGateError::InvalidOrder("order has no client id".to_string()))?;

        let mut state = self.state.lock();
        if state.live.contains_key(&id) {
            return Err(TradeGateError::InvalidOrder(format!("order {} is already tracked", id)));
        }
        debug!(client_order_id = %id, "Tracking order");
        state.live.insert(id, order);
        Ok(())
    }

    /// Forgets an order without retiring it, e.g. after a failed submit.
    pub fn untrack(&self, client_order_id: &str) -> Option<Arc<Order>> {
        self.state.lock().live.remove(client_order_id)
    }

    pub fn lookup(&self, client_order_id: &str) -> Option<Arc<Order>> {
        self.state.lock().live.get(client_order_id).cloned()
    }

    pub fn retire(&self, client_order_id: &str) {
        self.state.lock().retire(client_order_id);
    }

    pub fn is_retired(&self, client_order_id: &str) -> bool {
        self.state.lock().retired_ids.contains(client_order_id)
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Builds the update for `event`, or `None` if the order was already
    /// retired. A terminal status retires the order.
    pub fn correlate(&self, event: &OrderTradeEvent) -> Option<Correlation> {
        let mut state = self.state.lock();
        let id = event.client_order_id.as_str();

        if state.retired_ids.contains(id) {
            debug!(client_order_id = %id, status = %event.status, "Dropping update for retired order");
            return None;
        }

        let (order, tracked) = match state.live.get(id) {
            Some(order) => (Arc::clone(order), true),
            None => (Arc::new(event.to_order()), false),
        };

        let status = OrderStatus::from_exchange(&event.status);
        if let OrderStatus::Other(raw) = &status {
            warn!(client_order_id = %id, status = %raw, "Unmapped order status");
        }

        if status.is_terminal() {
            state.retire(id);
        }

        Some(Correlation {
            update: OrderUpdate {
                order,
                time: event.time,
                status,
                size: event.last_filled_size,
                total_size: event.filled_size,
                price: event.last_price,
                average_price: event.average_price,
            },
            tracked,
        })
    }
}
