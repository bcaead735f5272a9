use futures::future::{select_all, BoxFuture, FutureExt};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use tradegate_core::{Candle, MarketChannel, OrderUpdate, Result, Trade, TradeGateError};

use crate::correlator::OrderFilter;
use crate::market::MarketMultiplexer;
use crate::queue::{QueuePolicy, StreamQueue, Termination};
use crate::user::UserStreamManager;

pub type StreamId = u64;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_stream_id() -> StreamId {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where a connection actor delivers items for one consumer.
#[derive(Debug, Clone)]
pub enum ConsumerSink {
    Candles(Arc<StreamQueue<Candle>>),
    Trades(Arc<StreamQueue<Trade>>),
    OrderUpdates(Arc<StreamQueue<OrderUpdate>>),
}

impl ConsumerSink {
    pub fn kind(&self) -> &'static str {
        match self {
            ConsumerSink::Candles(_) => "candle",
            ConsumerSink::Trades(_) => "trade",
            ConsumerSink::OrderUpdates(_) => "order update",
        }
    }

    /// Whether this sink can carry events from `channel`.
    pub fn accepts(&self, channel: &MarketChannel) -> bool {
        match (self, channel) {
            (ConsumerSink::Candles(_), MarketChannel::Candles { .. }) => true,
            (ConsumerSink::Trades(_), MarketChannel::Trades { .. }) => true,
            (ConsumerSink::Candles(_), MarketChannel::Trades { .. })
            | (ConsumerSink::Trades(_), MarketChannel::Candles { .. })
            | (ConsumerSink::OrderUpdates(_), _) => false,
        }
    }

    pub fn terminate(&self, reason: Termination) {
        match self {
            ConsumerSink::Candles(queue) => queue.terminate(reason),
            ConsumerSink::Trades(queue) => queue.terminate(reason),
            ConsumerSink::OrderUpdates(queue) => queue.terminate(reason),
        }
    }
}

/// Item types a [`Stream`] can carry.
pub trait StreamItem: Clone + Send + Sync + 'static {
    fn sink(queue: Arc<StreamQueue<Self>>) -> ConsumerSink;
}

impl StreamItem for Candle {
    fn sink(queue: Arc<StreamQueue<Self>>) -> ConsumerSink {
        ConsumerSink::Candles(queue)
    }
}

impl StreamItem for Trade {
    fn sink(queue: Arc<StreamQueue<Self>>) -> ConsumerSink {
        ConsumerSink::Trades(queue)
    }
}

impl StreamItem for OrderUpdate {
    fn sink(queue: Arc<StreamQueue<Self>>) -> ConsumerSink {
        ConsumerSink::OrderUpdates(queue)
    }
}

#[derive(Clone)]
enum StreamSource {
    Market {
        mux: MarketMultiplexer,
        channels: Vec<MarketChannel>,
    },
    User {
        manager: UserStreamManager,
        filter: OrderFilter,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Open,
    Closed,
}

/// Consumer handle over one market or user subscription.
///
/// `open` registers with the owning connection, `read` waits for the next
/// item and `close` deregisters. Dropping an open stream deregisters it in
/// the background.
pub struct Stream<T: StreamItem> {
    id: StreamId,
    source: StreamSource,
    queue: Arc<StreamQueue<T>>,
    lifecycle: Lifecycle,
}

pub type CandleStream = Stream<Candle>;
pub type TradeStream = Stream<Trade>;
pub type OrderUpdateStream = Stream<OrderUpdate>;

impl<T: StreamItem> Stream<T> {
    pub fn market(mux: MarketMultiplexer, channels: Vec<MarketChannel>, policy: QueuePolicy) -> Self {
        Self::with_source(StreamSource::Market { mux, channels }, policy)
    }

    pub fn user(manager: UserStreamManager, filter: OrderFilter, policy: QueuePolicy) -> Self {
        Self::with_source(StreamSource::User { manager, filter }, policy)
    }

    fn with_source(source: StreamSource, policy: QueuePolicy) -> Self {
        Self {
            id: next_stream_id(),
            source,
            queue: Arc::new(StreamQueue::new(policy)),
            lifecycle: Lifecycle::Idle,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle == Lifecycle::Open
    }

    /// Market channels this stream spans; empty for user streams.
    pub fn channels(&self) -> &[MarketChannel] {
        match &self.source {
            StreamSource::Market { channels, .. } => channels,
            StreamSource::User { .. } => &[],
        }
    }

    /// Items waiting to be read.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Items discarded because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub async fn open(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Open => {
                return Err(TradeGateError::SubscriptionState(format!("{} is already open", self)));
            }
            Lifecycle::Closed => {
                return Err(TradeGateError::SubscriptionState(format!("{} was closed", self)));
            }
        }

        info!(stream = %self, "Opening stream");
        let sink = T::sink(Arc::clone(&self.queue));
        match &self.source {
            StreamSource::Market { mux, channels } => mux.attach(self.id, channels.clone(), sink).await?,
            StreamSource::User { manager, filter } => manager.attach(self.id, filter.clone(), sink).await?,
        }

        self.lifecycle = Lifecycle::Open;
        Ok(())
    }

    /// Waits for the next item. Items queued before the connection ended
    /// are still returned; after that the termination reason is.
    pub async fn read(&self) -> Result<T> {
        if self.lifecycle == Lifecycle::Idle {
            return Err(TradeGateError::SubscriptionState(format!("{} is not open", self)));
        }
        self.queue.pop().await
    }

    pub async fn close(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Open => {}
            Lifecycle::Idle => {
                return Err(TradeGateError::SubscriptionState(format!("{} was never opened", self)));
            }
            Lifecycle::Closed => {
                return Err(TradeGateError::SubscriptionState(format!("{} is already closed", self)));
            }
        }

        info!(stream = %self, "Closing stream");
        self.lifecycle = Lifecycle::Closed;

        let result = match &self.source {
            StreamSource::Market { mux, .. } => mux.detach(self.id).await,
            StreamSource::User { manager, .. } => manager.detach(self.id).await,
        };

        // A lost connection already dropped every registration.
        let connection_gone = self.queue.is_terminated();
        self.queue.close();

        match result {
            Err(TradeGateError::SubscriptionState(_)) if connection_gone => Ok(()),
            other => other,
        }
    }

    /// Keeps the underlying subscription alive after every consumer leaves.
    pub async fn persist(&self) -> Result<()> {
        match &self.source {
            StreamSource::Market { mux, channels } => mux.persist(channels.clone()).await,
            StreamSource::User { manager, .. } => manager.persist().await,
        }
    }
}

impl<T: StreamItem> Drop for Stream<T> {
    fn drop(&mut self) {
        if self.lifecycle != Lifecycle::Open {
            return;
        }
        debug!(stream_id = self.id, "Open stream dropped, detaching");
        match &self.source {
            StreamSource::Market { mux, .. } => mux.release(self.id),
            StreamSource::User { manager, .. } => manager.release(self.id),
        }
    }
}

impl<T: StreamItem> fmt::Display for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            StreamSource::Market { channels, .. } => {
                let names: Vec<String> = channels.iter().map(MarketChannel::wire_name).collect();
                write!(f, "market stream #{} [{}]", self.id, names.join(", "))
            }
            StreamSource::User { filter, .. } => match filter {
                OrderFilter::All => write!(f, "order update stream #{} [all]", self.id),
                OrderFilter::Orders(ids) => write!(f, "order update stream #{} [{} orders]", self.id, ids.len()),
            },
        }
    }
}

/// One item read from a [`MixedStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum MixedItem {
    Candle(Candle),
    Trade(Trade),
    OrderUpdate(OrderUpdate),
}

/// A member of a [`MixedStream`].
pub enum AnyStream {
    Candles(CandleStream),
    Trades(TradeStream),
    OrderUpdates(OrderUpdateStream),
}

impl AnyStream {
    async fn open(&mut self) -> Result<()> {
        match self {
            AnyStream::Candles(s) => s.open().await,
            AnyStream::Trades(s) => s.open().await,
            AnyStream::OrderUpdates(s) => s.open().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            AnyStream::Candles(s) => s.close().await,
            AnyStream::Trades(s) => s.close().await,
            AnyStream::OrderUpdates(s) => s.close().await,
        }
    }

    fn read(&self) -> BoxFuture<'_, Result<MixedItem>> {
        match self {
            AnyStream::Candles(s) => async move { s.read().await.map(MixedItem::Candle) }.boxed(),
            AnyStream::Trades(s) => async move { s.read().await.map(MixedItem::Trade) }.boxed(),
            AnyStream::OrderUpdates(s) => async move { s.read().await.map(MixedItem::OrderUpdate) }.boxed(),
        }
    }
}

impl From<CandleStream> for AnyStream {
    fn from(stream: CandleStream) -> Self {
        AnyStream::Candles(stream)
    }
}

impl From<TradeStream> for AnyStream {
    fn from(stream: TradeStream) -> Self {
        AnyStream::Trades(stream)
    }
}

impl From<OrderUpdateStream> for AnyStream {
    fn from(stream: OrderUpdateStream) -> Self {
        AnyStream::OrderUpdates(stream)
    }
}

/// Reads several heterogeneous streams as one, tagging each item with the
/// index of the stream it came from.
pub struct MixedStream {
    streams: Vec<AnyStream>,
}

impl MixedStream {
    pub fn new(streams: Vec<AnyStream>) -> Self {
        Self { streams }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Opens every member. On failure the members opened so far are closed
    /// again.
    pub async fn open(&mut self) -> Result<()> {
        for index in 0..self.streams.len() {
            if let Err(e) = self.streams[index].open().await {
                for opened in self.streams[..index].iter_mut() {
                    let _ = opened.close().await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Waits for the next item from any member. The first error from any
    /// member is returned as is.
    pub async fn read(&self) -> Result<(usize, MixedItem)> {
        if self.streams.is_empty() {
            return Err(TradeGateError::SubscriptionState("mixed stream has no members".to_string()));
        }

        let reads = self.streams.iter().map(AnyStream::read);
        let (result, index, _) = select_all(reads).await;
        result.map(|item| (index, item))
    }

    /// Closes every member, returning the first failure.
    pub async fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        for stream in self.streams.iter_mut() {
            if let Err(e) = stream.close().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::OrderCorrelator;
    use crate::market::ConnectionState;
    use crate::testing::{
        market_frame, order_frame, MockConnector, RecordingSessionKeys, TestMarketProtocol, TestUserProtocol,
    };
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_ok, task};
    use tradegate_core::Timeframe;

    fn market() -> (MarketMultiplexer, MockConnector) {
        let connector = MockConnector::new();
        let mux = MarketMultiplexer::spawn(
            Arc::new(connector.clone()),
            Arc::new(TestMarketProtocol::new()),
            Duration::ZERO,
        );
        (mux, connector)
    }

    fn user() -> (UserStreamManager, MockConnector, Arc<RecordingSessionKeys>) {
        let connector = MockConnector::new();
        let keys = Arc::new(RecordingSessionKeys::new());
        let manager = UserStreamManager::spawn(
            Arc::new(connector.clone()),
            Arc::new(TestUserProtocol),
            keys.clone(),
            Arc::new(OrderCorrelator::new()),
            Duration::from_secs(1800),
        );
        (manager, connector, keys)
    }

    fn trades(symbol: &str) -> MarketChannel {
        MarketChannel::trades(symbol)
    }

    #[tokio::test]
    async fn test_read_before_open_fails() {
        let (mux, _connector) = market();
        let stream = TradeStream::market(mux, vec![trades("btcusdt")], QueuePolicy::Unbounded);
        assert!(matches!(stream.read().await, Err(TradeGateError::SubscriptionState(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions_are_checked() {
        let (mux, _connector) = market();
        let mut stream = TradeStream::market(mux, vec![trades("btcusdt")], QueuePolicy::Unbounded);

        assert!(stream.close().await.is_err());
        stream.open().await.unwrap();
        assert!(stream.is_open());
        assert!(matches!(stream.open().await, Err(TradeGateError::SubscriptionState(_))));

        stream.close().await.unwrap();
        assert!(matches!(stream.close().await, Err(TradeGateError::SubscriptionState(_))));
        assert!(matches!(stream.open().await, Err(TradeGateError::SubscriptionState(_))));
        assert!(matches!(stream.read().await, Err(TradeGateError::SubscriptionState(_))));
    }

    #[tokio::test]
    async fn test_read_waits_for_next_item() {
        let (mux, connector) = market();
        let mut stream = TradeStream::market(mux, vec![trades("btcusdt")], QueuePolicy::Unbounded);
        stream.open().await.unwrap();

        {
            let mut read = task::spawn(stream.read());
            assert_pending!(read.poll());

            connector.last_session().unwrap().push(market_frame(&trades("btcusdt"), 3));
            while !read.is_woken() {
                tokio::task::yield_now().await;
            }
            let trade = assert_ready_ok!(read.poll());
            assert_eq!(trade.id, 3);
        }
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_after_connection_loss_succeeds() {
        let (mux, connector) = market();
        let mut stream = TradeStream::market(mux.clone(), vec![trades("btcusdt")], QueuePolicy::Unbounded);
        stream.open().await.unwrap();

        connector.last_session().unwrap().fail("reset");
        assert!(matches!(stream.read().await, Err(TradeGateError::ConnectionLost(_))));
        stream.close().await.unwrap();
        assert_eq!(mux.snapshot().await.unwrap().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_dropping_open_stream_detaches() {
        let (mux, connector) = market();
        let mut stream = TradeStream::market(mux.clone(), vec![trades("btcusdt")], QueuePolicy::Unbounded);
        stream.open().await.unwrap();
        drop(stream);

        // The release command is queued ahead of the snapshot.
        let snapshot = mux.snapshot().await.unwrap();
        assert_eq!(snapshot.consumers, 0);
        assert!(connector.last_session().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_persist_keeps_channel_after_close() {
        let (mux, connector) = market();
        let channel = MarketChannel::candles("btcusdt", Timeframe::M1);
        let mut stream = CandleStream::market(mux.clone(), vec![channel.clone()], QueuePolicy::Unbounded);
        stream.open().await.unwrap();
        stream.persist().await.unwrap();
        stream.close().await.unwrap();

        let snapshot = mux.snapshot().await.unwrap();
        assert!(snapshot.channel(&channel).unwrap().persistent);
        assert!(!connector.last_session().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_mixed_stream_tags_items_by_member() {
        let (mux, market_connector) = market();
        let (manager, user_connector, _keys) = user();

        let mut mixed = MixedStream::new(vec![
            TradeStream::market(mux.clone(), vec![trades("btcusdt")], QueuePolicy::Unbounded).into(),
            OrderUpdateStream::user(manager, OrderFilter::All, QueuePolicy::Unbounded).into(),
        ]);
        mixed.open().await.unwrap();

        user_connector.last_session().unwrap().push(order_frame("x1", "NEW"));
        let (index, item) = mixed.read().await.unwrap();
        assert_eq!(index, 1);
        assert!(matches!(item, MixedItem::OrderUpdate(_)));

        market_connector.last_session().unwrap().push(market_frame(&trades("btcusdt"), 4));
        let (index, item) = mixed.read().await.unwrap();
        assert_eq!(index, 0);
        match item {
            MixedItem::Trade(trade) => assert_eq!(trade.id, 4),
            other => panic!("unexpected item: {:?}", other),
        }

        mixed.close().await.unwrap();
        assert_eq!(mux.snapshot().await.unwrap().consumers, 0);
    }

    #[tokio::test]
    async fn test_mixed_stream_rolls_back_failed_open() {
        let (mux, _market_connector) = market();
        let (manager, _user_connector, keys) = user();
        keys.fail_next_create();

        let mut mixed = MixedStream::new(vec![
            TradeStream::market(mux.clone(), vec![trades("btcusdt")], QueuePolicy::Unbounded).into(),
            OrderUpdateStream::user(manager, OrderFilter::All, QueuePolicy::Unbounded).into(),
        ]);

        assert!(mixed.open().await.is_err());
        assert_eq!(mux.snapshot().await.unwrap().consumers, 0);
    }

    #[tokio::test]
    async fn test_mixed_stream_surfaces_member_error() {
        let (mux, connector) = market();
        let mut mixed = MixedStream::new(vec![
            TradeStream::market(mux.clone(), vec![trades("btcusdt")], QueuePolicy::Unbounded).into(),
            TradeStream::market(mux, vec![trades("ethusdt")], QueuePolicy::Unbounded).into(),
        ]);
        mixed.open().await.unwrap();

        connector.last_session().unwrap().close_cleanly();
        assert!(matches!(mixed.read().await, Err(TradeGateError::StreamEnded)));
    }

    #[tokio::test]
    async fn test_stream_display_names_channels() {
        let (mux, _connector) = market();
        let stream = CandleStream::market(
            mux,
            vec![MarketChannel::candles("btcusdt", Timeframe::M3)],
            QueuePolicy::Unbounded,
        );
        assert!(stream.to_string().ends_with("[btcusdt@kline_3m]"));
    }
}
