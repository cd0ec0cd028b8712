//! # AMQP 1.0 Engine
//!
//! [`AmqpEngine`] implements [`Engine`] on top of `fe2o3-amqp`. The crate
//! exposes connections, sessions and links as async handles, so each of them
//! lives in a spawned task that reports back over one signal channel:
//!
//! - a **connection task** performs the open handshake on its TCP stream,
//!   then either attaches the links the driver asks for (initiating side) or
//!   accepts the sessions and links the peer begins (responding side);
//! - a **sender task** per sending link turns every queued message into a
//!   transfer and every settlement into an `Accepted` event;
//! - a **receiver task** per receiving link accepts each delivery and hands
//!   it on as a `Delivered` event.
//!
//! Engine state is only touched in the command methods and in
//! [`Engine::next_event`], which turns signals into [`EngineEvent`]s.
//!
//! Peer credit is not visible through `fe2o3-amqp` sender handles. A sending
//! link instead exposes a small pipeline of [`SEND_PIPELINE`] slots. A slot
//! is taken by [`Engine::send`] and returned once the message went out as a
//! transfer, which itself waits for link credit from the peer.

use async_trait::async_trait;
use fe2o3_amqp::acceptor::error::AcceptorAttachError;
use fe2o3_amqp::acceptor::{
    ConnectionAcceptor, LinkAcceptor, LinkEndpoint, ListenerSessionHandle,
    SaslAnonymousMechanism, SessionAcceptor,
};
use fe2o3_amqp::connection::Error as ConnectionError;
use fe2o3_amqp::link::receiver::CreditMode;
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::types::messaging::{
    ApplicationProperties, Body, Data, Header, Message as AmqpMessage, MessageId, Properties,
};
use fe2o3_amqp::types::primitives::{SimpleValue, Value};
use fe2o3_amqp::{Connection, Receiver, Sender, Session};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    ConnectionId, DeliveryId, Endpoint, Engine, EngineEvent, Handshake, LinkId, ListenerId,
    Message, TimerId, ANONYMOUS,
};
use crate::error::EngineError;

/// Messages a sending link accepts ahead of their transfer.
pub const SEND_PIPELINE: u32 = 8;

/// Pause after a failed `accept` before the listener tries again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Requests from the engine to a connection task.
enum Command {
    OpenSender {
        link: LinkId,
        name: String,
        address: String,
    },
    OpenReceiver {
        link: LinkId,
        name: String,
        address: String,
        credit_window: u32,
    },
    Close,
}

/// Notifications from listener, connection, link and timer tasks.
enum Signal {
    Accepted {
        listener: ListenerId,
        connection: ConnectionId,
        commands: UnboundedSender<Command>,
    },
    AcceptFailed {
        listener: ListenerId,
        error: String,
    },
    Opened {
        connection: ConnectionId,
    },
    /// A link the driver asked for is attached.
    Attached {
        link: LinkId,
        endpoint: LinkEndpoint,
    },
    AttachFailed {
        link: LinkId,
        error: String,
    },
    /// The peer attached a link on a responding connection.
    Offered {
        connection: ConnectionId,
        endpoint: LinkEndpoint,
    },
    Transferred {
        link: LinkId,
    },
    Settled {
        link: LinkId,
        delivery: DeliveryId,
        accepted: bool,
    },
    Delivered {
        link: LinkId,
        delivery: DeliveryId,
        message: Message,
    },
    LinkFailed {
        link: LinkId,
        error: String,
    },
    Closed {
        connection: ConnectionId,
        error: Option<String>,
    },
    Timer {
        timer: TimerId,
    },
}

enum LinkState {
    /// Attach requested, no answer yet.
    Attaching,
    Sending {
        outgoing: UnboundedSender<(DeliveryId, Message)>,
        credit: u32,
        task: JoinHandle<()>,
    },
    /// Peer-initiated receiver waiting for [`Engine::accept_receiver`].
    Requested(Receiver),
    Receiving {
        task: JoinHandle<()>,
    },
}

impl LinkState {
    fn abort(&self) {
        match self {
            LinkState::Sending { task, .. } | LinkState::Receiving { task } => task.abort(),
            LinkState::Attaching | LinkState::Requested(_) => {}
        }
    }
}

struct ConnectionState {
    commands: UnboundedSender<Command>,
    handshake: Handshake,
    closing: bool,
    links: HashMap<u32, LinkState>,
    next_handle: u32,
    next_delivery_id: u64,
}

impl ConnectionState {
    fn new(commands: UnboundedSender<Command>, handshake: Handshake) -> Self {
        Self {
            commands,
            handshake,
            closing: false,
            links: HashMap::new(),
            next_handle: 0,
            next_delivery_id: 0,
        }
    }

    fn allocate_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        for link in self.links.values() {
            link.abort();
        }
    }
}

struct ListenerState {
    addr: SocketAddr,
    handshake: Handshake,
    task: JoinHandle<()>,
}

/// Protocol engine speaking AMQP 1.0 over TCP.
///
/// Must be used from within a tokio runtime: every command that touches the
/// network spawns or feeds a task.
pub struct AmqpEngine {
    container_id: String,
    connections: HashMap<ConnectionId, ConnectionState>,
    listeners: HashMap<ListenerId, ListenerState>,
    timers: HashMap<TimerId, JoinHandle<()>>,
    next_connection_id: Arc<AtomicU64>,
    next_listener_id: u64,
    next_timer_id: u64,
    signals_tx: UnboundedSender<Signal>,
    signals_rx: UnboundedReceiver<Signal>,
    ready: VecDeque<EngineEvent>,
}

impl AmqpEngine {
    /// Create an engine that identifies itself to peers as `container_id`.
    pub fn new(container_id: impl Into<String>) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            container_id: container_id.into(),
            connections: HashMap::new(),
            listeners: HashMap::new(),
            timers: HashMap::new(),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            next_listener_id: 1,
            next_timer_id: 1,
            signals_tx,
            signals_rx,
            ready: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.connections.is_empty() && self.listeners.is_empty()
    }

    fn connection_mut(
        &mut self,
        connection: ConnectionId,
    ) -> Result<&mut ConnectionState, EngineError> {
        let state = self
            .connections
            .get_mut(&connection)
            .ok_or(EngineError::UnknownConnection(connection))?;
        if state.closing {
            return Err(EngineError::ConnectionClosed(connection));
        }
        Ok(state)
    }

    /// Start the task that owns a newly attached link.
    fn install(&mut self, link: LinkId, endpoint: LinkEndpoint, credit_window: Option<u32>) {
        let signals = self.signals_tx.clone();
        let Some(state) = self.connections.get_mut(&link.connection) else {
            return;
        };

        match endpoint {
            LinkEndpoint::Sender(sender) => {
                let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(send_loop(link, sender, outgoing_rx, signals));
                state.links.insert(
                    link.handle,
                    LinkState::Sending {
                        outgoing,
                        credit: SEND_PIPELINE,
                        task,
                    },
                );
                self.ready.push_back(EngineEvent::Sendable {
                    link,
                    credit: SEND_PIPELINE,
                });
            }
            LinkEndpoint::Receiver(receiver) => {
                let task = tokio::spawn(receive_loop(link, receiver, credit_window, signals));
                state
                    .links
                    .insert(link.handle, LinkState::Receiving { task });
            }
        }
    }

    fn process(&mut self, signal: Signal) {
        match signal {
            Signal::Accepted {
                listener,
                connection,
                commands,
            } => {
                // Dropping `commands` makes the task give up on a connection
                // accepted by a listener that has since been stopped.
                if let Some(state) = self.listeners.get(&listener) {
                    let state = ConnectionState::new(commands, state.handshake);
                    self.connections.insert(connection, state);
                } else {
                    debug!("Dropping {} accepted by stopped listener", connection);
                }
            }

            Signal::AcceptFailed { listener, error } => {
                if self.listeners.contains_key(&listener) {
                    self.ready.push_back(EngineEvent::TransportError {
                        connection: None,
                        error,
                    });
                }
            }

            Signal::Opened { connection } => {
                if let Some(state) = self.connections.get(&connection) {
                    if !state.closing {
                        debug!("Connection {} opened", connection);
                        self.ready
                            .push_back(EngineEvent::ConnectionOpened { connection });
                    }
                }
            }

            Signal::Attached { link, endpoint } => {
                let pending = self
                    .connections
                    .get(&link.connection)
                    .filter(|state| !state.closing)
                    .map_or(false, |state| state.links.contains_key(&link.handle));
                if pending {
                    debug!("Link {} attached", link);
                    self.install(link, endpoint, None);
                }
            }

            Signal::AttachFailed { link, error } => {
                let Some(state) = self.connections.get_mut(&link.connection) else {
                    return;
                };
                state.links.remove(&link.handle);
                if !state.closing {
                    self.ready.push_back(EngineEvent::TransportError {
                        connection: Some(link.connection),
                        error,
                    });
                }
            }

            Signal::Offered {
                connection,
                endpoint,
            } => {
                let Some(state) = self
                    .connections
                    .get_mut(&connection)
                    .filter(|state| !state.closing)
                else {
                    return;
                };
                let link = LinkId {
                    connection,
                    handle: state.allocate_handle(),
                };

                match endpoint {
                    LinkEndpoint::Receiver(receiver) => {
                        let target = receiver
                            .target()
                            .as_ref()
                            .and_then(|target| target.address.clone())
                            .unwrap_or_default();
                        state.links.insert(link.handle, LinkState::Requested(receiver));
                        self.ready
                            .push_back(EngineEvent::ReceiverOpenRequested { link, target });
                    }
                    sender @ LinkEndpoint::Sender(_) => {
                        debug!("Auto-attached sender {} for the peer's receiver", link);
                        self.install(link, sender, None);
                    }
                }
            }

            Signal::Transferred { link } => {
                let Some(LinkState::Sending { credit, .. }) = self
                    .connections
                    .get_mut(&link.connection)
                    .and_then(|state| state.links.get_mut(&link.handle))
                else {
                    return;
                };
                *credit = (*credit + 1).min(SEND_PIPELINE);
                let credit = *credit;
                trace!("Link {} has {} credit", link, credit);
                self.ready.push_back(EngineEvent::Sendable { link, credit });
            }

            Signal::Settled {
                link,
                delivery,
                accepted,
            } => {
                if !self.connections.contains_key(&link.connection) {
                    return;
                }
                if accepted {
                    self.ready.push_back(EngineEvent::Accepted { link, delivery });
                } else {
                    debug!("Delivery {:?} on {} was not accepted", delivery, link);
                }
            }

            Signal::Delivered {
                link,
                delivery,
                message,
            } => {
                let open = self
                    .connections
                    .get(&link.connection)
                    .map_or(false, |state| !state.closing);
                if open {
                    self.ready.push_back(EngineEvent::Delivered {
                        link,
                        delivery,
                        message,
                    });
                }
            }

            Signal::LinkFailed { link, error } => {
                if let Some(state) = self.connections.get_mut(&link.connection) {
                    if let Some(entry) = state.links.remove(&link.handle) {
                        entry.abort();
                    }
                    if !state.closing {
                        debug!("Link {} ended: {}", link, error);
                    }
                }
            }

            Signal::Closed { connection, error } => {
                let Some(state) = self.connections.remove(&connection) else {
                    return;
                };
                match error {
                    Some(error) if !state.closing => {
                        debug!("Transport error on {}: {}", connection, error);
                        self.ready.push_back(EngineEvent::TransportError {
                            connection: Some(connection),
                            error,
                        });
                    }
                    Some(error) => debug!("Connection {} closed: {}", connection, error),
                    None => debug!("Connection {} closed", connection),
                }
                self.ready
                    .push_back(EngineEvent::ConnectionClosed { connection });
            }

            Signal::Timer { timer } => {
                if self.timers.remove(&timer).is_some() {
                    self.ready.push_back(EngineEvent::TimerFired { timer });
                }
            }
        }
    }

    fn attach(
        &mut self,
        connection: ConnectionId,
        request: LinkRequest,
    ) -> Result<LinkId, EngineError> {
        let name = format!("{}-{}", self.container_id, Uuid::new_v4());
        let state = self.connection_mut(connection)?;
        if state.handshake != Handshake::Initiate {
            return Err(EngineError::NotInitiator(connection));
        }

        let link = LinkId {
            connection,
            handle: state.allocate_handle(),
        };
        let command = match request {
            LinkRequest::Sender { address } => Command::OpenSender {
                link,
                name,
                address,
            },
            LinkRequest::Receiver {
                address,
                credit_window,
            } => Command::OpenReceiver {
                link,
                name,
                address,
                credit_window,
            },
        };
        state
            .commands
            .send(command)
            .map_err(|_| EngineError::ConnectionClosed(connection))?;
        state.links.insert(link.handle, LinkState::Attaching);
        Ok(link)
    }
}

enum LinkRequest {
    Sender { address: String },
    Receiver { address: String, credit_window: u32 },
}

impl Drop for AmqpEngine {
    fn drop(&mut self) {
        for (_, listener) in self.listeners.drain() {
            listener.task.abort();
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }
}

fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    socket2::SockRef::from(stream).set_nodelay(true)
}

fn check_mechanism(mechanism: &str) -> Result<(), EngineError> {
    if mechanism == ANONYMOUS {
        Ok(())
    } else {
        Err(EngineError::UnsupportedMechanism(mechanism.to_string()))
    }
}

/// Convert a driver message into an AMQP message with a single data section.
fn encode(message: Message) -> AmqpMessage<Data> {
    let mut properties = ApplicationProperties::builder();
    for (key, value) in message.properties {
        properties = properties.insert(key, SimpleValue::Long(value));
    }

    AmqpMessage::builder()
        .header(Header {
            durable: message.durable,
            ..Default::default()
        })
        .properties(Properties {
            message_id: message.id.map(MessageId::String),
            ..Default::default()
        })
        .application_properties(properties.build())
        .data(message.body)
        .build()
}

fn message_id(id: &MessageId) -> String {
    match id {
        MessageId::String(id) => id.clone(),
        MessageId::Ulong(id) => id.to_string(),
        MessageId::Uuid(id) => {
            let bytes: &[u8; 16] = id.as_ref();
            Uuid::from_bytes(*bytes).to_string()
        }
        MessageId::Binary(id) => String::from_utf8_lossy(id).into_owned(),
    }
}

fn integer(value: &SimpleValue) -> Option<i64> {
    match value {
        SimpleValue::Long(v) => Some(*v),
        SimpleValue::Int(v) => Some(i64::from(*v)),
        SimpleValue::Short(v) => Some(i64::from(*v)),
        SimpleValue::Byte(v) => Some(i64::from(*v)),
        SimpleValue::Ulong(v) => i64::try_from(*v).ok(),
        SimpleValue::Uint(v) => Some(i64::from(*v)),
        SimpleValue::Ushort(v) => Some(i64::from(*v)),
        SimpleValue::Ubyte(v) => Some(i64::from(*v)),
        _ => None,
    }
}

/// Convert a delivered AMQP message into the driver's view of it.
fn decode(message: &AmqpMessage<Body<Value>>) -> Message {
    let id = message
        .properties
        .as_ref()
        .and_then(|properties| properties.message_id.as_ref())
        .map(message_id);
    let durable = message
        .header
        .as_ref()
        .map_or(false, |header| header.durable);
    let properties = message
        .application_properties
        .as_ref()
        .map(|properties| {
            properties
                .iter()
                .filter_map(|(key, value)| integer(value).map(|value| (key.clone(), value)))
                .collect()
        })
        .unwrap_or_default();

    Message {
        id,
        durable,
        properties,
        body: Vec::new(),
    }
}

/// `None` for a clean close by the peer.
fn close_error(result: Result<(), ConnectionError>) -> Option<String> {
    match result {
        Ok(()) | Err(ConnectionError::RemoteClosed) => None,
        Err(e) => Some(e.to_string()),
    }
}

async fn send_loop(
    link: LinkId,
    mut sender: Sender,
    mut outgoing: UnboundedReceiver<(DeliveryId, Message)>,
    signals: UnboundedSender<Signal>,
) {
    while let Some((delivery, message)) = outgoing.recv().await {
        let settlement = match sender.send_batchable(encode(message)).await {
            Ok(settlement) => settlement,
            Err(e) => {
                let _ = signals.send(Signal::LinkFailed {
                    link,
                    error: e.to_string(),
                });
                return;
            }
        };
        if signals.send(Signal::Transferred { link }).is_err() {
            return;
        }

        let signals = signals.clone();
        tokio::spawn(async move {
            let accepted = match settlement.await {
                Ok(outcome) => outcome.is_accepted(),
                Err(e) => {
                    trace!("No outcome for {:?} on {}: {}", delivery, link, e);
                    false
                }
            };
            let _ = signals.send(Signal::Settled {
                link,
                delivery,
                accepted,
            });
        });
    }
    let _ = sender.close().await;
}

async fn receive_loop(
    link: LinkId,
    mut receiver: Receiver,
    credit_window: Option<u32>,
    signals: UnboundedSender<Signal>,
) {
    if let Some(credit) = credit_window {
        if let Err(e) = receiver.set_credit(credit).await {
            let _ = signals.send(Signal::LinkFailed {
                link,
                error: e.to_string(),
            });
            return;
        }
    }

    loop {
        let delivery = match receiver.recv::<Body<Value>>().await {
            Ok(delivery) => delivery,
            Err(e) => {
                let _ = signals.send(Signal::LinkFailed {
                    link,
                    error: e.to_string(),
                });
                return;
            }
        };
        // Deliveries are accepted on the driver's behalf.
        if let Err(e) = receiver.accept(&delivery).await {
            let _ = signals.send(Signal::LinkFailed {
                link,
                error: e.to_string(),
            });
            return;
        }

        let delivered = Signal::Delivered {
            link,
            delivery: DeliveryId(u64::from(*delivery.delivery_id())),
            message: decode(delivery.message()),
        };
        if signals.send(delivered).is_err() {
            return;
        }
    }
}

/// Accept every link the peer attaches on one session.
async fn accept_links(
    connection: ConnectionId,
    mut session: ListenerSessionHandle,
    signals: UnboundedSender<Signal>,
) {
    let acceptor = LinkAcceptor::new();
    loop {
        match acceptor.accept(&mut session).await {
            Ok(endpoint) => {
                if signals.send(Signal::Offered { connection, endpoint }).is_err() {
                    return;
                }
            }
            Err(AcceptorAttachError::IllegalSessionState) => return,
            Err(e) => debug!("Refused a link on {}: {}", connection, e),
        }
    }
}

async fn initiate(
    connection: ConnectionId,
    stream: TcpStream,
    container_id: String,
    mut commands: UnboundedReceiver<Command>,
    signals: UnboundedSender<Signal>,
) {
    let opening = async move {
        let mut handle = Connection::builder()
            .container_id(container_id)
            .sasl_profile(SaslProfile::Anonymous)
            .open_with_stream(stream)
            .await
            .map_err(|e| format!("AMQP open failed: {}", e))?;
        let session = Session::begin(&mut handle)
            .await
            .map_err(|e| format!("AMQP begin failed: {}", e))?;
        Ok::<_, String>((handle, session))
    };

    let (mut handle, mut session) = tokio::select! {
        opened = opening => match opened {
            Ok(opened) => opened,
            Err(error) => {
                let _ = signals.send(Signal::Closed { connection, error: Some(error) });
                return;
            }
        },
        _ = commands.recv() => {
            let _ = signals.send(Signal::Closed { connection, error: None });
            return;
        }
    };
    let _ = signals.send(Signal::Opened { connection });

    let error = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::OpenSender { link, name, address }) => {
                    let signal = match Sender::attach(&mut session, name, address).await {
                        Ok(sender) => Signal::Attached {
                            link,
                            endpoint: LinkEndpoint::Sender(sender),
                        },
                        Err(e) => Signal::AttachFailed {
                            link,
                            error: format!("failed to attach sender: {}", e),
                        },
                    };
                    let _ = signals.send(signal);
                }
                Some(Command::OpenReceiver { link, name, address, credit_window }) => {
                    let attached = Receiver::builder()
                        .name(name)
                        .source(address)
                        .credit_mode(CreditMode::Auto(credit_window))
                        .attach(&mut session)
                        .await;
                    let signal = match attached {
                        Ok(receiver) => Signal::Attached {
                            link,
                            endpoint: LinkEndpoint::Receiver(receiver),
                        },
                        Err(e) => Signal::AttachFailed {
                            link,
                            error: format!("failed to attach receiver: {}", e),
                        },
                    };
                    let _ = signals.send(signal);
                }
                Some(Command::Close) | None => {
                    let _ = session.end().await;
                    let _ = handle.close().await;
                    break None;
                }
            },
            closed = handle.on_close() => break close_error(closed),
        }
    };
    let _ = signals.send(Signal::Closed { connection, error });
}

async fn respond(
    connection: ConnectionId,
    stream: TcpStream,
    container_id: String,
    mut commands: UnboundedReceiver<Command>,
    signals: UnboundedSender<Signal>,
) {
    let acceptor = ConnectionAcceptor::builder()
        .container_id(container_id)
        .sasl_acceptor(SaslAnonymousMechanism::new())
        .build();

    let mut handle = tokio::select! {
        accepted = acceptor.accept(stream) => match accepted {
            Ok(handle) => handle,
            Err(e) => {
                let error = Some(format!("AMQP open failed: {}", e));
                let _ = signals.send(Signal::Closed { connection, error });
                return;
            }
        },
        _ = commands.recv() => {
            let _ = signals.send(Signal::Closed { connection, error: None });
            return;
        }
    };
    let _ = signals.send(Signal::Opened { connection });

    let session_acceptor = SessionAcceptor::new();
    let mut sessions = Vec::new();
    let error = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Close) | None => {
                    let _ = handle.close().await;
                    break None;
                }
                Some(_) => trace!("{} does not attach links", connection),
            },
            session = session_acceptor.accept(&mut handle) => match session {
                Ok(session) => {
                    let task = tokio::spawn(accept_links(connection, session, signals.clone()));
                    sessions.push(task);
                }
                Err(_) => break close_error(handle.on_close().await),
            },
        }
    };

    for task in sessions {
        task.abort();
    }
    let _ = signals.send(Signal::Closed { connection, error });
}

async fn run_connection(
    connection: ConnectionId,
    stream: TcpStream,
    handshake: Handshake,
    container_id: String,
    commands: UnboundedReceiver<Command>,
    signals: UnboundedSender<Signal>,
) {
    match handshake {
        Handshake::Initiate => initiate(connection, stream, container_id, commands, signals).await,
        Handshake::Respond => respond(connection, stream, container_id, commands, signals).await,
    }
}

async fn accept_loop(
    listener_id: ListenerId,
    listener: TcpListener,
    handshake: Handshake,
    container_id: String,
    next_connection_id: Arc<AtomicU64>,
    signals: UnboundedSender<Signal>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let connection = ConnectionId(next_connection_id.fetch_add(1, Ordering::Relaxed));
                debug!("Accepted connection {} from {}", connection, peer);

                if let Err(e) = configure_stream(&stream) {
                    warn!("Failed to configure socket from {}: {}", peer, e);
                }

                let (commands, commands_rx) = mpsc::unbounded_channel();
                let accepted = Signal::Accepted {
                    listener: listener_id,
                    connection,
                    commands,
                };
                if signals.send(accepted).is_err() {
                    break;
                }
                tokio::spawn(run_connection(
                    connection,
                    stream,
                    handshake,
                    container_id.clone(),
                    commands_rx,
                    signals.clone(),
                ));
            }
            Err(e) => {
                // Running out of descriptors is transient; keep the listener.
                let failed = Signal::AcceptFailed {
                    listener: listener_id,
                    error: format!("failed to accept connection: {}", e),
                };
                if signals.send(failed).is_err() {
                    break;
                }
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

#[async_trait]
impl Engine for AmqpEngine {
    fn connect(
        &mut self,
        endpoint: &Endpoint,
        mechanism: &str,
        handshake: Handshake,
    ) -> Result<ConnectionId, EngineError> {
        check_mechanism(mechanism)?;
        let connection = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        self.connections
            .insert(connection, ConnectionState::new(commands, handshake));

        let addr = endpoint.to_string();
        let container_id = self.container_id.clone();
        let signals = self.signals_tx.clone();
        debug!("Connecting {} to {}", connection, addr);
        tokio::spawn(async move {
            let stream = match TcpStream::connect(&addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = signals.send(Signal::Closed {
                        connection,
                        error: Some(format!("failed to connect to {}: {}", addr, e)),
                    });
                    return;
                }
            };
            if let Err(e) = configure_stream(&stream) {
                warn!("Failed to configure socket for {}: {}", addr, e);
            }
            run_connection(
                connection,
                stream,
                handshake,
                container_id,
                commands_rx,
                signals,
            )
            .await;
        });

        Ok(connection)
    }

    fn listen(
        &mut self,
        endpoint: &Endpoint,
        mechanism: &str,
        handshake: Handshake,
    ) -> Result<ListenerId, EngineError> {
        check_mechanism(mechanism)?;
        let addr = endpoint.to_string();
        let std_listener =
            std::net::TcpListener::bind(&addr).map_err(|source| EngineError::Listen {
                endpoint: addr.clone(),
                source,
            })?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;

        let task = tokio::spawn(accept_loop(
            id,
            listener,
            handshake,
            self.container_id.clone(),
            self.next_connection_id.clone(),
            self.signals_tx.clone(),
        ));
        self.listeners.insert(
            id,
            ListenerState {
                addr: local_addr,
                handshake,
                task,
            },
        );

        info!("Listening on {}", local_addr);
        Ok(id)
    }

    fn listener_addr(&self, listener: ListenerId) -> Option<SocketAddr> {
        self.listeners.get(&listener).map(|state| state.addr)
    }

    fn stop_listener(&mut self, listener: ListenerId) {
        if let Some(state) = self.listeners.remove(&listener) {
            state.task.abort();
            debug!("Stopped listener on {}", state.addr);
        }
    }

    fn open_connection(&mut self, connection: ConnectionId) -> Result<(), EngineError> {
        self.connection_mut(connection)?;
        debug!("Waiting for links on {}", connection);
        Ok(())
    }

    fn open_sender(
        &mut self,
        connection: ConnectionId,
        address: &str,
    ) -> Result<LinkId, EngineError> {
        let request = LinkRequest::Sender {
            address: address.to_string(),
        };
        self.attach(connection, request)
    }

    fn open_receiver(
        &mut self,
        connection: ConnectionId,
        address: &str,
        credit_window: u32,
    ) -> Result<LinkId, EngineError> {
        let request = LinkRequest::Receiver {
            address: address.to_string(),
            credit_window,
        };
        self.attach(connection, request)
    }

    fn accept_receiver(
        &mut self,
        link: LinkId,
        target: &str,
        credit_window: u32,
    ) -> Result<(), EngineError> {
        let state = self.connection_mut(link.connection)?;
        let receiver = match state.links.remove(&link.handle) {
            Some(LinkState::Requested(receiver)) => receiver,
            Some(other) => {
                state.links.insert(link.handle, other);
                return Err(EngineError::UnknownLink(link));
            }
            None => return Err(EngineError::UnknownLink(link)),
        };

        debug!("Accepted receiver {} for '{}'", link, target);
        self.install(link, LinkEndpoint::Receiver(receiver), Some(credit_window));
        Ok(())
    }

    fn credit(&self, link: LinkId) -> u32 {
        match self
            .connections
            .get(&link.connection)
            .and_then(|state| state.links.get(&link.handle))
        {
            Some(LinkState::Sending { credit, .. }) => *credit,
            _ => 0,
        }
    }

    fn send(&mut self, link: LinkId, message: Message) -> Result<DeliveryId, EngineError> {
        let state = self.connection_mut(link.connection)?;
        let delivery = DeliveryId(state.next_delivery_id);

        let (outgoing, credit) = match state.links.get_mut(&link.handle) {
            Some(LinkState::Sending {
                outgoing, credit, ..
            }) => (outgoing, credit),
            Some(LinkState::Attaching) => return Err(EngineError::NoCredit(link)),
            _ => return Err(EngineError::UnknownLink(link)),
        };
        if *credit == 0 {
            return Err(EngineError::NoCredit(link));
        }
        outgoing
            .send((delivery, message))
            .map_err(|_| EngineError::ConnectionClosed(link.connection))?;
        *credit -= 1;
        state.next_delivery_id += 1;
        Ok(delivery)
    }

    fn close_connection(&mut self, connection: ConnectionId) {
        let Some(state) = self.connections.get_mut(&connection) else {
            return;
        };
        if state.closing {
            return;
        }
        state.closing = true;
        if state.commands.send(Command::Close).is_err() {
            debug!("Connection task for {} already finished", connection);
        }
        debug!("Closing {}", connection);
    }

    fn schedule(&mut self, delay: Duration) -> TimerId {
        let timer = TimerId(self.next_timer_id);
        self.next_timer_id += 1;

        let signals = self.signals_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(Signal::Timer { timer });
        });
        self.timers.insert(timer, task);
        timer
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        if let Some(task) = self.timers.remove(&timer) {
            task.abort();
        }
    }

    async fn next_event(&mut self) -> Option<EngineEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }
            if self.is_idle() {
                return None;
            }
            let signal = self.signals_rx.recv().await?;
            self.process(signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SEND_TIME_PROPERTY;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn loopback() -> Endpoint {
        Endpoint::new("127.0.0.1", 0)
    }

    async fn next(engine: &mut AmqpEngine) -> Option<EngineEvent> {
        timeout(WAIT, engine.next_event())
            .await
            .expect("engine produced no event in time")
    }

    fn numbered(n: u64) -> Message {
        let mut message = Message::with_body(vec![b'x'; 8]);
        message.id = Some(n.to_string());
        message.durable = true;
        message
            .properties
            .insert(SEND_TIME_PROPERTY.to_string(), 1_000 + n as i64);
        message
    }

    #[test]
    fn test_encode_maps_fields_to_amqp_sections() {
        let encoded = encode(numbered(7));

        assert!(encoded.header.as_ref().unwrap().durable);
        assert_eq!(
            encoded.properties.as_ref().unwrap().message_id,
            Some(MessageId::String("7".to_string()))
        );
        assert_eq!(
            encoded
                .application_properties
                .as_ref()
                .unwrap()
                .get(SEND_TIME_PROPERTY),
            Some(&SimpleValue::Long(1_007))
        );
        assert_eq!(&encoded.body.0[..], b"xxxxxxxx");
    }

    #[test]
    fn test_decode_keeps_integer_properties_only() {
        let properties = ApplicationProperties::builder()
            .insert(SEND_TIME_PROPERTY, SimpleValue::Uint(42))
            .insert("Label", SimpleValue::String("ignored".to_string()))
            .build();
        let message = AmqpMessage {
            header: Some(Header {
                durable: true,
                ..Default::default()
            }),
            delivery_annotations: None,
            message_annotations: None,
            properties: Some(Properties {
                message_id: Some(MessageId::Ulong(12)),
                ..Default::default()
            }),
            application_properties: Some(properties),
            body: Body::<Value>::Empty,
            footer: None,
        };

        let decoded = decode(&message);

        assert_eq!(decoded.id.as_deref(), Some("12"));
        assert!(decoded.durable);
        assert_eq!(decoded.send_time(), Some(42));
        assert_eq!(decoded.properties.len(), 1);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_decode_without_sections() {
        let message = AmqpMessage {
            header: None,
            delivery_annotations: None,
            message_annotations: None,
            properties: None,
            application_properties: None,
            body: Body::<Value>::Empty,
            footer: None,
        };

        assert_eq!(decode(&message), Message::default());
    }

    /// Server accepts a receiver with a window of 2 and the client pushes 3
    /// messages through it, so the third one rides on replenished credit.
    #[tokio::test]
    async fn test_transfer_with_credit_replenishment() {
        let mut server = AmqpEngine::new("server");
        let listener = server
            .listen(&loopback(), ANONYMOUS, Handshake::Respond)
            .unwrap();
        let port = server.listener_addr(listener).unwrap().port();

        let server_task = tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(event) = next(&mut server).await {
                match event {
                    EngineEvent::ConnectionOpened { connection } => {
                        server.open_connection(connection).unwrap()
                    }
                    EngineEvent::ReceiverOpenRequested { link, target } => {
                        assert_eq!(target, "q0");
                        server.accept_receiver(link, &target, 2).unwrap();
                    }
                    EngineEvent::Delivered { message, .. } => {
                        received.push(message);
                        if received.len() == 3 {
                            server.stop_listener(listener);
                        }
                    }
                    EngineEvent::ConnectionClosed { .. } => {}
                    other => panic!("unexpected server event {:?}", other),
                }
            }
            received
        });

        let mut client = AmqpEngine::new("client");
        let connection = client
            .connect(
                &Endpoint::new("127.0.0.1", port),
                ANONYMOUS,
                Handshake::Initiate,
            )
            .unwrap();
        let mut sent = 0;
        let mut accepted = 0;
        while let Some(event) = next(&mut client).await {
            match event {
                EngineEvent::ConnectionOpened { connection } => {
                    client.open_sender(connection, "q0").unwrap();
                }
                EngineEvent::Sendable { link, credit } => {
                    assert!(credit <= SEND_PIPELINE);
                    while client.credit(link) > 0 && sent < 3 {
                        sent += 1;
                        client.send(link, numbered(sent)).unwrap();
                    }
                }
                EngineEvent::Accepted { .. } => {
                    accepted += 1;
                    if accepted == 3 {
                        client.close_connection(connection);
                    }
                }
                EngineEvent::ConnectionClosed { .. } => {}
                other => panic!("unexpected client event {:?}", other),
            }
        }

        assert_eq!(accepted, 3);
        let received = server_task.await.unwrap();
        let ids: Vec<_> = received.iter().filter_map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(received[2].send_time(), Some(1_003));
        assert!(received.iter().all(|m| m.durable));
    }

    #[tokio::test]
    async fn test_send_before_attach_fails() {
        let mut server = AmqpEngine::new("server");
        let listener = server
            .listen(&loopback(), ANONYMOUS, Handshake::Respond)
            .unwrap();
        let port = server.listener_addr(listener).unwrap().port();

        let mut client = AmqpEngine::new("client");
        let connection = client
            .connect(
                &Endpoint::new("127.0.0.1", port),
                ANONYMOUS,
                Handshake::Initiate,
            )
            .unwrap();
        let link = client.open_sender(connection, "q0").unwrap();

        assert_eq!(client.credit(link), 0);
        assert!(matches!(
            client.send(link, Message::default()),
            Err(EngineError::NoCredit(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_connection_reports_transport_error() {
        let mut server = AmqpEngine::new("server");
        let listener = server
            .listen(&loopback(), ANONYMOUS, Handshake::Respond)
            .unwrap();
        let addr = server.listener_addr(listener).unwrap();

        drop(TcpStream::connect(addr).await.unwrap());

        assert!(matches!(
            next(&mut server).await.unwrap(),
            EngineEvent::TransportError {
                connection: Some(_),
                ..
            }
        ));
        assert!(matches!(
            next(&mut server).await.unwrap(),
            EngineEvent::ConnectionClosed { .. }
        ));
        assert!(server.listener_addr(listener).is_some());
    }

    /// A peer that skips SASL gets the SASL protocol header back and is
    /// turned away without taking the listener down.
    #[tokio::test]
    async fn test_plain_amqp_header_is_refused() {
        let mut server = AmqpEngine::new("server");
        let listener = server
            .listen(&loopback(), ANONYMOUS, Handshake::Respond)
            .unwrap();
        let addr = server.listener_addr(listener).unwrap();

        let peer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut header = [0u8; 8];
            stream.write_all(b"AMQP\x00\x01\x00\x00").await.unwrap();
            stream.read_exact(&mut header).await.unwrap();
            header
        });

        match next(&mut server).await {
            Some(EngineEvent::TransportError {
                connection: Some(_),
                error,
            }) => assert!(error.contains("AMQP open failed"), "{}", error),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(&peer.await.unwrap(), b"AMQP\x03\x01\x00\x00");
        assert!(server.listener_addr(listener).is_some());
    }

    #[tokio::test]
    async fn test_refused_connection_reports_transport_error() {
        let port = {
            let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            taken.local_addr().unwrap().port()
        };

        let mut client = AmqpEngine::new("client");
        client
            .connect(
                &Endpoint::new("127.0.0.1", port),
                ANONYMOUS,
                Handshake::Initiate,
            )
            .unwrap();

        match next(&mut client).await {
            Some(EngineEvent::TransportError { error, .. }) => {
                assert!(error.contains("failed to connect"))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            next(&mut client).await,
            Some(EngineEvent::ConnectionClosed { .. })
        ));
        assert_eq!(next(&mut client).await, None);
    }

    #[tokio::test]
    async fn test_other_mechanisms_are_unsupported() {
        let mut engine = AmqpEngine::new("client");
        let endpoint = Endpoint::new("127.0.0.1", 5672);

        assert!(matches!(
            engine.connect(&endpoint, "PLAIN", Handshake::Initiate),
            Err(EngineError::UnsupportedMechanism(m)) if m == "PLAIN"
        ));
        assert!(matches!(
            engine.listen(&loopback(), "PLAIN", Handshake::Respond),
            Err(EngineError::UnsupportedMechanism(_))
        ));
        assert_eq!(engine.next_event().await, None);
    }

    /// An initiating listener attaches a receiver on a connection it
    /// accepted. The responding client gets a sender for it without asking.
    #[tokio::test]
    async fn test_listener_initiates_receiver_to_responding_client() {
        let mut server = AmqpEngine::new("server");
        let listener = server
            .listen(&loopback(), ANONYMOUS, Handshake::Initiate)
            .unwrap();
        let port = server.listener_addr(listener).unwrap().port();

        let server_task = tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(event) = next(&mut server).await {
                match event {
                    EngineEvent::ConnectionOpened { connection } => {
                        server.open_receiver(connection, "q0", 1).unwrap();
                    }
                    EngineEvent::Delivered { message, .. } => {
                        ids.push(message.id.unwrap());
                        if ids.len() == 2 {
                            server.stop_listener(listener);
                        }
                    }
                    EngineEvent::ConnectionClosed { .. } => {}
                    other => panic!("unexpected server event {:?}", other),
                }
            }
            ids
        });

        let mut client = AmqpEngine::new("client");
        let connection = client
            .connect(
                &Endpoint::new("127.0.0.1", port),
                ANONYMOUS,
                Handshake::Respond,
            )
            .unwrap();
        let mut sent = 0;
        let mut accepted = 0;
        while let Some(event) = next(&mut client).await {
            match event {
                EngineEvent::ConnectionOpened { connection } => {
                    client.open_connection(connection).unwrap();
                    assert!(matches!(
                        client.open_sender(connection, "q0"),
                        Err(EngineError::NotInitiator(_))
                    ));
                }
                EngineEvent::Sendable { link, .. } => {
                    while client.credit(link) > 0 && sent < 2 {
                        sent += 1;
                        client.send(link, numbered(sent)).unwrap();
                    }
                }
                EngineEvent::Accepted { .. } => {
                    accepted += 1;
                    if accepted == 2 {
                        client.close_connection(connection);
                    }
                }
                EngineEvent::ConnectionClosed { .. } => {}
                other => panic!("unexpected client event {:?}", other),
            }
        }

        assert_eq!(accepted, 2);
        assert_eq!(server_task.await.unwrap(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_accept_failure_keeps_listener() {
        let mut engine = AmqpEngine::new("server");
        let listener = engine
            .listen(&loopback(), ANONYMOUS, Handshake::Respond)
            .unwrap();

        engine.process(Signal::AcceptFailed {
            listener,
            error: "failed to accept connection: too many open files".to_string(),
        });
        engine.process(Signal::AcceptFailed {
            listener: ListenerId(99),
            error: "stale".to_string(),
        });

        assert_eq!(
            next(&mut engine).await,
            Some(EngineEvent::TransportError {
                connection: None,
                error: "failed to accept connection: too many open files".to_string(),
            })
        );
        assert!(engine.listener_addr(listener).is_some());

        engine.stop_listener(listener);
        assert_eq!(next(&mut engine).await, None);
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let mut engine = AmqpEngine::new("timers");
        let listener = engine
            .listen(&loopback(), ANONYMOUS, Handshake::Respond)
            .unwrap();

        let cancelled = engine.schedule(Duration::from_millis(10));
        let kept = engine.schedule(Duration::from_millis(50));
        engine.cancel_timer(cancelled);

        assert_eq!(
            next(&mut engine).await,
            Some(EngineEvent::TimerFired { timer: kept })
        );

        engine.stop_listener(listener);
        assert_eq!(next(&mut engine).await, None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_unknown_ids_are_ignored() {
        let mut engine = AmqpEngine::new("client");
        engine.close_connection(ConnectionId(42));
        engine.stop_listener(ListenerId(7));
        engine.cancel_timer(TimerId(9));
        assert!(matches!(
            engine.accept_receiver(
                LinkId {
                    connection: ConnectionId(42),
                    handle: 0,
                },
                "q0",
                1,
            ),
            Err(EngineError::UnknownConnection(_))
        ));
        assert_eq!(engine.next_event().await, None);
    }
}
