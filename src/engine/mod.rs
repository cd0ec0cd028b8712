//! # Protocol Engine Interface
//!
//! The driver never touches sockets or frames directly. It talks to a
//! protocol engine through the [`Engine`] trait: commands are synchronous,
//! non-blocking requests that the engine queues, and everything the network
//! does comes back as an [`EngineEvent`] pulled one at a time with
//! [`Engine::next_event`]. Because events are pulled by a single loop, the
//! driver's state is only ever touched from one place and needs no locking.
//!
//! The built-in implementation is [`AmqpEngine`], which speaks AMQP 1.0
//! over TCP through `fe2o3-amqp`. Any other engine can be slotted in by
//! implementing the trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::EngineError;

pub mod amqp;

pub use amqp::AmqpEngine;

/// SASL mechanism used by the benchmark for both roles.
pub const ANONYMOUS: &str = "ANONYMOUS";

/// Application property carrying the sender's epoch-millisecond timestamp.
pub const SEND_TIME_PROPERTY: &str = "SendTime";

/// Identifies one connection owned by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Identifies one listener owned by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Identifies a link by its connection and the local handle assigned to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId {
    pub connection: ConnectionId,
    pub handle: u32,
}

/// Identifies one transfer on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryId(pub u64);

/// Identifies a scheduled one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/link-{}", self.connection, self.handle)
    }
}

/// Which side of the AMQP open exchange a connection takes.
///
/// The initiating side writes its protocol header first, begins the session
/// and attaches links. The responding side answers and accepts whatever the
/// initiator attaches. This is independent of which side dialled TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Initiate,
    Respond,
}

/// A transport endpoint, `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A message as the driver sees it.
///
/// Only integer application properties survive the trip through an engine.
/// Bodies of delivered messages are not retained.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    pub id: Option<String>,
    pub durable: bool,
    pub properties: BTreeMap<String, i64>,
    pub body: Vec<u8>,
}

impl Message {
    /// Create a message carrying `body` and nothing else.
    pub fn with_body(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Value of the `SendTime` application property, if present.
    pub fn send_time(&self) -> Option<i64> {
        self.properties.get(SEND_TIME_PROPERTY).copied()
    }
}

/// Everything an engine reports back to the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The remote peer opened the connection.
    ConnectionOpened { connection: ConnectionId },

    /// The connection finished closing and is gone.
    ConnectionClosed { connection: ConnectionId },

    /// The peer wants to send to us and asks for a receiver on `target`.
    ReceiverOpenRequested { link: LinkId, target: String },

    /// A sender link has `credit` messages worth of credit available.
    Sendable { link: LinkId, credit: u32 },

    /// A message arrived on a receiver link.
    Delivered {
        link: LinkId,
        delivery: DeliveryId,
        message: Message,
    },

    /// The peer accepted a message we sent.
    Accepted { link: LinkId, delivery: DeliveryId },

    /// A connection failed or was closed with an error. `connection` is
    /// absent for failures not tied to one connection.
    TransportError {
        connection: Option<ConnectionId>,
        error: String,
    },

    /// A timer scheduled with [`Engine::schedule`] expired.
    TimerFired { timer: TimerId },
}

/// Capability set a protocol engine provides to the driver.
///
/// Commands never block. Their effects become visible through later events.
#[async_trait]
pub trait Engine: Send {
    /// Start an outbound connection to `endpoint`.
    fn connect(
        &mut self,
        endpoint: &Endpoint,
        mechanism: &str,
        handshake: Handshake,
    ) -> Result<ConnectionId, EngineError>;

    /// Start accepting inbound connections on `endpoint`. Every accepted
    /// connection takes the `handshake` side.
    fn listen(
        &mut self,
        endpoint: &Endpoint,
        mechanism: &str,
        handshake: Handshake,
    ) -> Result<ListenerId, EngineError>;

    /// Address a listener is bound to.
    fn listener_addr(&self, listener: ListenerId) -> Option<SocketAddr>;

    /// Stop accepting connections. Stopping twice is a no-op.
    fn stop_listener(&mut self, listener: ListenerId);

    /// Acknowledge a connection the driver will not attach links on.
    fn open_connection(&mut self, connection: ConnectionId) -> Result<(), EngineError>;

    /// Attach a sender link targeting `address`.
    fn open_sender(
        &mut self,
        connection: ConnectionId,
        address: &str,
    ) -> Result<LinkId, EngineError>;

    /// Attach a receiver link reading from `address`, granting `credit_window`.
    fn open_receiver(
        &mut self,
        connection: ConnectionId,
        address: &str,
        credit_window: u32,
    ) -> Result<LinkId, EngineError>;

    /// Answer a peer's request for a receiver link.
    fn accept_receiver(
        &mut self,
        link: LinkId,
        target: &str,
        credit_window: u32,
    ) -> Result<(), EngineError>;

    /// Credit remaining on a sender link. Unknown links have none.
    fn credit(&self, link: LinkId) -> u32;

    /// Queue a message on a sender link, consuming one credit.
    fn send(&mut self, link: LinkId, message: Message) -> Result<DeliveryId, EngineError>;

    /// Begin closing a connection. Closing twice is a no-op.
    fn close_connection(&mut self, connection: ConnectionId);

    /// Arm a one-shot timer.
    fn schedule(&mut self, delay: Duration) -> TimerId;

    /// Disarm a timer. Cancelling a fired or unknown timer is a no-op.
    fn cancel_timer(&mut self, timer: TimerId);

    /// Wait for the next event. Returns `None` once the engine has no open
    /// or pending connections and no listeners.
    async fn next_event(&mut self) -> Option<EngineEvent>;
}
