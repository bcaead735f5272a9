//! User data stream manager.
//!
//! Leases a session key, keeps it alive and fans order updates out to
//! attached consumers. Structured like the market multiplexer: a single
//! actor owns the socket, the key and the consumer registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tradegate_core::{Result, TradeGateError};

use crate::correlator::{OrderCorrelator, OrderFilter, OrderTradeEvent};
use crate::keepalive::spawn_keepalive;
use crate::market::ConnectionState;
use crate::queue::Termination;
use crate::stream::{ConsumerSink, StreamId};
use crate::traits::{FrameSink, FrameSource, SessionKeyProvider, UserEvent, UserProtocol, WsConnector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSnapshot {
    pub state: ConnectionState,
    pub epoch: u64,
    pub consumers: usize,
    pub persistent: bool,
    pub has_session_key: bool,
}

enum Command {
    Attach {
        id: StreamId,
        filter: OrderFilter,
        sink: ConsumerSink,
        reply: oneshot::Sender<Result<()>>,
    },
    Detach {
        id: StreamId,
        reply: oneshot::Sender<Result<()>>,
    },
    Persist {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<UserSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Inbound {
    Event { epoch: u64, event: UserEvent },
    Closed { epoch: u64, error: Option<String> },
}

#[derive(Clone)]
pub struct UserStreamManager {
    commands: mpsc::UnboundedSender<Command>,
}

impl UserStreamManager {
    pub fn spawn(
        connector: Arc<dyn WsConnector>,
        protocol: Arc<dyn UserProtocol>,
        keys: Arc<dyn SessionKeyProvider>,
        correlator: Arc<OrderCorrelator>,
        keepalive_interval: Duration,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let actor = UserActor {
            connector,
            protocol,
            keys,
            correlator,
            keepalive_interval,
            state: ConnectionState::Disconnected,
            epoch: 0,
            session_key: None,
            sink: None,
            reader: None,
            keepalive: None,
            consumers: HashMap::new(),
            persistent: false,
            inbound_tx,
        };
        tokio::spawn(actor.run(command_rx, inbound_rx));

        Self { commands }
    }

    pub async fn attach(&self, id: StreamId, filter: OrderFilter, sink: ConsumerSink) -> Result<()> {
        self.request(|reply| Command::Attach { id, filter, sink, reply }).await?
    }

    pub async fn detach(&self, id: StreamId) -> Result<()> {
        self.request(|reply| Command::Detach { id, reply }).await?
    }

    pub fn release(&self, id: StreamId) {
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(Command::Detach { id, reply });
    }

    /// Connects if needed and keeps the session open with zero consumers.
    pub async fn persist(&self) -> Result<()> {
        self.request(|reply| Command::Persist { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<UserSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

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
    TradeGateError::SubscriptionState("user stream manager is shut down".to_string())
}

struct Consumer {
    filter: OrderFilter,
    sink: ConsumerSink,
}

struct UserActor {
    connector: Arc<dyn WsConnector>,
    protocol: Arc<dyn UserProtocol>,
    keys: Arc<dyn SessionKeyProvider>,
    correlator: Arc<OrderCorrelator>,
    keepalive_interval: Duration,
    state: ConnectionState,
    epoch: u64,
    session_key: Option<String>,
    sink: Option<Box<dyn FrameSink>>,
    reader: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    consumers: HashMap<StreamId, Consumer>,
    persistent: bool,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
}

impl UserActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        debug!("User stream manager started");
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
        debug!("User stream manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Attach { id, filter, sink, reply } => {
                let _ = reply.send(self.attach(id, filter, sink).await);
            }
            Command::Detach { id, reply } => {
                let _ = reply.send(self.detach(id).await);
            }
            Command::Persist { reply } => {
                let _ = reply.send(self.persist().await);
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

    async fn attach(&mut self, id: StreamId, filter: OrderFilter, sink: ConsumerSink) -> Result<()> {
        if !matches!(sink, ConsumerSink::OrderUpdates(_)) {
            return Err(TradeGateError::SubscriptionState(format!(
                "{} stream #{} cannot receive order updates",
                sink.kind(),
                id
            )));
        }
        if self.consumers.contains_key(&id) {
            return Err(TradeGateError::SubscriptionState(format!("stream #{} is already attached", id)));
        }

        self.ensure_connected().await?;
        debug!(stream_id = id, "Order update consumer attached");
        self.consumers.insert(id, Consumer { filter, sink });
        Ok(())
    }

    async fn detach(&mut self, id: StreamId) -> Result<()> {
        if self.consumers.remove(&id).is_none() {
            return Err(TradeGateError::SubscriptionState(format!("stream #{} is not attached", id)));
        }
        debug!(stream_id = id, remaining = self.consumers.len(), "Order update consumer detached");

        if self.consumers.is_empty() && !self.persistent && self.state == ConnectionState::Connected {
            self.disconnect().await;
        }
        Ok(())
    }

    async fn persist(&mut self) -> Result<()> {
        self.ensure_connected().await?;
        if !self.persistent {
            info!("User stream persisted");
        }
        self.persistent = true;
        Ok(())
    }

    fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            state: self.state,
            epoch: self.epoch,
            consumers: self.consumers.len(),
            persistent: self.persistent,
            has_session_key: self.session_key.is_some(),
        }
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;

        let key = match self.keys.create().await {
            Ok(key) => key,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                error!(error = %e, "Failed to create session key");
                return Err(e);
            }
        };

        let url = self.protocol.connect_url(&key);
        let session = match self.connector.connect(&url).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "User stream connection failed");
                if let Err(release_err) = self.keys.release(&key).await {
                    warn!(error = %release_err, "Failed to release session key after connect failure");
                }
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        self.epoch += 1;
        self.sink = Some(session.sink);
        self.reader = Some(spawn_reader(
            self.epoch,
            session.source,
            Arc::clone(&self.protocol),
            self.inbound_tx.clone(),
        ));
        self.keepalive = Some(spawn_keepalive(
            Arc::clone(&self.keys),
            key.clone(),
            self.keepalive_interval,
        ));
        self.session_key = Some(key);
        self.state = ConnectionState::Connected;
        info!(epoch = self.epoch, "User stream connected");
        Ok(())
    }

    /// Local teardown: stop refreshing, close the socket, give the key back.
    async fn disconnect(&mut self) {
        self.state = ConnectionState::Closing;
        self.stop_keepalive().await;

        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Error closing user socket");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }

        self.release_key().await;
        self.persistent = false;
        self.state = ConnectionState::Disconnected;
        info!(epoch = self.epoch, "User stream disconnected");
    }

    async fn stop_keepalive(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
            let _ = keepalive.await;
        }
    }

    async fn release_key(&mut self) {
        if let Some(key) = self.session_key.take() {
            if let Err(e) = self.keys.release(&key).await {
                warn!(error = %e, "Failed to release session key");
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.state == ConnectionState::Connected {
            self.disconnect().await;
        }
        for (_, consumer) in self.consumers.drain() {
            consumer.sink.terminate(Termination::Ended);
        }
    }

    async fn handle_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::Event { epoch, event } if self.is_current(epoch) => match event {
                UserEvent::OrderTradeUpdate(event) => self.dispatch(&event),
                UserEvent::SessionExpired => {
                    error!(epoch, "Session key expired");
                    // An expired key cannot be released.
                    self.session_key = None;
                    self.connection_ended(Termination::Failed("session key expired".to_string()))
                        .await;
                }
            },
            Inbound::Closed { epoch, error } if self.is_current(epoch) => {
                let reason = match error {
                    None => {
                        info!(epoch, "User socket closed by server");
                        Termination::Ended
                    }
                    Some(error) => {
                        error!(epoch, error = %error, "User connection lost");
                        Termination::Failed(error)
                    }
                };
                self.connection_ended(reason).await;
            }
            _ => {}
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.state == ConnectionState::Connected
    }

    fn dispatch(&self, event: &OrderTradeEvent) {
        let Some(correlation) = self.correlator.correlate(event) else {
            return;
        };
        debug!(
            client_order_id = %event.client_order_id,
            status = %correlation.update.status,
            tracked = correlation.tracked,
            "Order update"
        );

        for consumer in self.consumers.values() {
            if !consumer.filter.matches(&event.client_order_id, correlation.tracked) {
                continue;
            }
            if let ConsumerSink::OrderUpdates(queue) = &consumer.sink {
                queue.push(correlation.update.clone());
            }
        }
    }

    /// The server side went away. Every consumer is terminated and the
    /// manager returns to its initial state.
    async fn connection_ended(&mut self, reason: Termination) {
        self.stop_keepalive().await;
        self.sink = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        self.release_key().await;
        self.persistent = false;
        self.state = ConnectionState::Disconnected;

        for (_, consumer) in self.consumers.drain() {
            consumer.sink.terminate(reason.clone());
        }
    }
}

fn spawn_reader(
    epoch: u64,
    mut source: Box<dyn FrameSource>,
    protocol: Arc<dyn UserProtocol>,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.next_frame().await {
                Ok(Some(frame)) => {
                    if let Some(event) = protocol.decode(&frame) {
                        if inbound.send(Inbound::Event { epoch, event }).is_err() {
                            break;
                        }
                    }
                }
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
