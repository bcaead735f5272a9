//! Market subscription multiplexer.
//!
//! One actor task owns the market socket and all subscription state.
//! [`MarketMultiplexer`] handles send it commands; a reader task forwards
//! decoded frames to it tagged with the connection epoch they came from.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use tradegate_core::{MarketChannel, MarketEvent, Result, TradeGateError};

use crate::queue::Termination;
use crate::stream::{ConsumerSink, StreamId};
use crate::traits::{FrameSink, FrameSource, MarketProtocol, WsConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel: MarketChannel,
    pub consumers: usize,
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketSnapshot {
    pub state: ConnectionState,
    pub epoch: u64,
    pub channels: Vec<ChannelSnapshot>,
    pub consumers: usize,
}

impl MarketSnapshot {
    pub fn channel(&self, channel: &MarketChannel) -> Option<&ChannelSnapshot> {
        self.channels.iter().find(|c| &c.channel == channel)
    }

    /// Attached consumer count for `channel`; zero when not subscribed.
    pub fn consumers_of(&self, channel: &MarketChannel) -> usize {
        self.channel(channel).map_or(0, |c| c.consumers)
    }
}

enum Command {
    Attach {
        id: StreamId,
        channels: Vec<MarketChannel>,
        sink: ConsumerSink,
        reply: oneshot::Sender<Result<()>>,
    },
    Detach {
        id: StreamId,
        reply: oneshot::Sender<Result<()>>,
    },
    Persist {
        channels: Vec<MarketChannel>,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<MarketSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Inbound {
    Event {
        epoch: u64,
        channel: MarketChannel,
        event: MarketEvent,
    },
    Closed {
        epoch: u64,
        error: Option<String>,
    },
}

/// Handle to the market connection actor. Cheap to clone; the actor stops
/// when every handle is dropped or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct MarketMultiplexer {
    commands: mpsc::UnboundedSender<Command>,
}

impl MarketMultiplexer {
    /// Spawns the actor. Must be called inside a Tokio runtime.
    pub fn spawn(
        connector: Arc<dyn WsConnector>,
        protocol: Arc<dyn MarketProtocol>,
        control_interval: Duration,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let actor = MarketActor::new(connector, protocol, control_interval, inbound_tx);
        tokio::spawn(actor.run(command_rx, inbound_rx));

        Self { commands }
    }

    /// Registers consumer `id` on `channels`. Connects or subscribes as
    /// needed; on failure no subscription state changes.
    pub async fn attach(&self, id: StreamId, channels: Vec<MarketChannel>, sink: ConsumerSink) -> Result<()> {
        self.request(|reply| Command::Attach { id, channels, sink, reply }).await?
    }

    pub async fn detach(&self, id: StreamId) -> Result<()> {
        self.request(|reply| Command::Detach { id, reply }).await?
    }

    /// Detaches without waiting for the outcome.
    pub fn release(&self, id: StreamId) {
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(Command::Detach { id, reply });
    }

    /// Subscribes `channels` if needed and keeps them subscribed with zero
    /// consumers.
    pub async fn persist(&self, channels: Vec<MarketChannel>) -> Result<()> {
        self.request(|reply| Command::Persist { channels, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<MarketSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Closes the socket, ends every attached stream and stops the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.commands.send(make(reply)).map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())
    }
}

fn stopped() -> TradeGateError {
    TradeGateError::SubscriptionState("market multiplexer is shut down".to_string())
}

#[derive(Debug, Default)]
struct ChannelEntry {
    subscribers: HashSet<StreamId>,
    persistent: bool,
}

impl ChannelEntry {
    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && !self.persistent
    }
}

struct Consumer {
    channels: Vec<MarketChannel>,
    sink: ConsumerSink,
}

/// Enforces a minimum gap between outbound control frames.
struct ControlPacer {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl ControlPacer {
    fn new(interval: Duration) -> Self {
        Self { interval, last_sent: None }
    }

    async fn wait(&mut self) {
        if let Some(last) = self.last_sent {
            let ready_at = last + self.interval;
            if ready_at > Instant::now() {
                sleep_until(ready_at).await;
            }
        }
        self.last_sent = Some(Instant::now());
    }
}

struct MarketActor {
    connector: Arc<dyn WsConnector>,
    protocol: Arc<dyn MarketProtocol>,
    state: ConnectionState,
    epoch: u64,
    sink: Option<Box<dyn FrameSink>>,
    reader: Option<JoinHandle<()>>,
    channels: BTreeMap<MarketChannel, ChannelEntry>,
    consumers: HashMap<StreamId, Consumer>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    pacer: ControlPacer,
}

impl MarketActor {
    fn new(
        connector: Arc<dyn WsConnector>,
        protocol: Arc<dyn MarketProtocol>,
        control_interval: Duration,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            connector,
            protocol,
            state: ConnectionState::Disconnected,
            epoch: 0,
            sink: None,
            reader: None,
            channels: BTreeMap::new(),
            consumers: HashMap::new(),
            inbound_tx,
            pacer: ControlPacer::new(control_interval),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        debug!("Market multiplexer started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(message) = inbound.recv() => self.handle_inbound(message).await,
            }
        }
        debug!("Market multiplexer stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Attach { id, channels, sink, reply } => {
                let _ = reply.send(self.attach(id, channels, sink).await);
            }
            Command::Detach { id, reply } => {
                let _ = reply.send(self.detach(id).await);
            }
            Command::Persist { channels, reply } => {
                let _ = reply.send(self.persist(channels).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn attach(&mut self, id: StreamId, mut channels: Vec<MarketChannel>, sink: ConsumerSink) -> Result<()> {
        if self.consumers.contains_key(&id) {
            return Err(TradeGateError::SubscriptionState(format!("stream #{} is already attached", id)));
        }
        if channels.is_empty() {
            return Err(TradeGateError::SubscriptionState(format!("stream #{} has no channels", id)));
        }
        if let Some(channel) = channels.iter().find(|c| !sink.accepts(c)) {
            return Err(TradeGateError::SubscriptionState(format!(
                "{} stream #{} cannot receive {}",
                sink.kind(),
                id,
                channel
            )));
        }

        channels.sort();
        channels.dedup();

        let missing = self.unsubscribed(&channels);
        self.subscribe(&missing).await?;

        for channel in &channels {
            self.channels.entry(channel.clone()).or_default().subscribers.insert(id);
        }
        debug!(stream_id = id, channels = channels.len(), new = missing.len(), "Consumer attached");
        self.consumers.insert(id, Consumer { channels, sink });
        Ok(())
    }

    async fn detach(&mut self, id: StreamId) -> Result<()> {
        let consumer = self
            .consumers
            .remove(&id)
            .ok_or_else(|| TradeGateError::SubscriptionState(format!("stream #{} is not attached", id)))?;

        for channel in &consumer.channels {
            if let Some(entry) = self.channels.get_mut(channel) {
                entry.subscribers.remove(&id);
            }
        }

        // Includes channels left over from an earlier failed unsubscribe.
        let emptied: Vec<MarketChannel> = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.is_idle())
            .map(|(channel, _)| channel.clone())
            .collect();
        debug!(stream_id = id, emptied = emptied.len(), "Consumer detached");

        if !emptied.is_empty() {
            let frame = self.protocol.unsubscribe_frame(&emptied);
            match self.send_control(frame).await {
                Ok(()) => {
                    for channel in &emptied {
                        self.channels.remove(channel);
                    }
                }
                Err(e) => warn!(
                    error = %e,
                    channels = emptied.len(),
                    "Unsubscribe failed, channels stay registered"
                ),
            }
        }

        if self.state == ConnectionState::Connected && self.channels.values().all(ChannelEntry::is_idle) {
            self.disconnect().await;
            self.channels.clear();
        }
        Ok(())
    }

    async fn persist(&mut self, mut channels: Vec<MarketChannel>) -> Result<()> {
        if channels.is_empty() {
            return Ok(());
        }
        channels.sort();
        channels.dedup();

        let missing = self.unsubscribed(&channels);
        self.subscribe(&missing).await?;

        for channel in channels {
            info!(channel = %channel, "Channel persisted");
            self.channels.entry(channel).or_default().persistent = true;
        }
        Ok(())
    }

    fn snapshot(&self) -> MarketSnapshot {
        MarketSnapshot {
            state: self.state,
            epoch: self.epoch,
            channels: self
                .channels
                .iter()
                .map(|(channel, entry)| ChannelSnapshot {
                    channel: channel.clone(),
                    consumers: entry.subscribers.len(),
                    persistent: entry.persistent,
                })
                .collect(),
            consumers: self.consumers.len(),
        }
    }

    fn unsubscribed(&self, channels: &[MarketChannel]) -> Vec<MarketChannel> {
        channels
            .iter()
            .filter(|c| !self.channels.contains_key(c))
            .cloned()
            .collect()
    }

    /// Makes `channels` live on the socket, connecting if there is none.
    async fn subscribe(&mut self, channels: &[MarketChannel]) -> Result<()> {
        if channels.is_empty() {
            return Ok(());
        }
        match self.state {
            ConnectionState::Connected => {
                let frame = self.protocol.subscribe_frame(channels);
                self.send_control(frame).await
            }
            _ => self.connect(channels).await,
        }
    }

    async fn connect(&mut self, channels: &[MarketChannel]) -> Result<()> {
        self.state = ConnectionState::Connecting;
        let url = self.protocol.connect_url(channels);

        match self.connector.connect(&url).await {
            Ok(session) => {
                self.epoch += 1;
                self.sink = Some(session.sink);
                self.reader = Some(spawn_reader(
                    self.epoch,
                    session.source,
                    Arc::clone(&self.protocol),
                    self.inbound_tx.clone(),
                ));
                self.state = ConnectionState::Connected;
                info!(epoch = self.epoch, channels = channels.len(), "Market stream connected");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                error!(error = %e, "Market stream connection failed");
                Err(e)
            }
        }
    }

    async fn send_control(&mut self, frame: String) -> Result<()> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| TradeGateError::ConnectionLost("market socket is not connected".to_string()))?;
        self.pacer.wait().await;
        debug!(frame = %frame, "Sending market control frame");
        sink.send(frame).await
    }

    /// Closes the socket and waits for the reader to finish.
    async fn disconnect(&mut self) {
        self.state = ConnectionState::Closing;
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Error closing market socket");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        self.state = ConnectionState::Disconnected;
        info!(epoch = self.epoch, "Market stream disconnected");
    }

    async fn shutdown(&mut self) {
        if self.state == ConnectionState::Connected {
            self.disconnect().await;
        }
        self.end_all(Termination::Ended);
    }

    fn end_all(&mut self, reason: Termination) {
        for (_, consumer) in self.consumers.drain() {
            consumer.sink.terminate(reason.clone());
        }
        self.channels.clear();
    }

    async fn handle_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::Event { epoch, channel, event } => {
                if epoch != self.epoch || self.state != ConnectionState::Connected {
                    return;
                }
                let Some(entry) = self.channels.get(&channel) else {
                    return;
                };
                for id in &entry.subscribers {
                    if let Some(consumer) = self.consumers.get(id) {
                        deliver(&consumer.sink, &event);
                    }
                }
            }
            Inbound::Closed { epoch, error } => {
                if epoch != self.epoch || self.state != ConnectionState::Connected {
                    return;
                }

                let reason = match error {
                    None => {
                        info!(epoch, "Market socket closed by server");
                        Termination::Ended
                    }
                    Some(error) => {
                        error!(epoch, error = %error, "Market connection lost");
                        Termination::Failed(error)
                    }
                };

                self.sink = None;
                if let Some(reader) = self.reader.take() {
                    let _ = reader.await;
                }
                self.state = ConnectionState::Disconnected;
                self.end_all(reason);
            }
        }
    }
}

fn deliver(sink: &ConsumerSink, event: &MarketEvent) {
    match (sink, event) {
        (ConsumerSink::Candles(queue), MarketEvent::Candle(candle)) => {
            queue.push(candle.clone());
        }
        (ConsumerSink::Trades(queue), MarketEvent::Trade(trade)) => {
            queue.push(trade.clone());
        }
        (ConsumerSink::Candles(_), MarketEvent::Trade(_))
        | (ConsumerSink::Trades(_), MarketEvent::Candle(_))
        | (ConsumerSink::OrderUpdates(_), _) => {}
    }
}

fn spawn_reader(
    epoch: u64,
    mut source: Box<dyn FrameSource>,
    protocol: Arc<dyn MarketProtocol>,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.next_frame().await {
                Ok(Some(frame)) => match protocol.decode(&frame) {
                    Some((channel, event)) => {
                        if inbound.send(Inbound::Event { epoch, channel, event }).is_err() {
                            break;
                        }
                    }
                    None => debug!(frame = %frame, "Ignoring market frame"),
                },
                Ok(None) => {
                    let _ = inbound.send(Inbound::Closed { epoch, error: None });
                    break;
                }
                Err(e) => {
                    let _ = inbound.send(Inbound::Closed {
                        epoch,
                        error: Some(e.to_string()),
                    });
                    break;
                }
            }
        }
    })
}
