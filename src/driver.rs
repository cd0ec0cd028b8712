//! # Benchmark Driver
//!
//! The driver is the only place where decisions are made. It reacts to one
//! [`EngineEvent`] at a time and answers with engine commands:
//!
//! - **Startup**: dial out (client) or listen (server), and arm the optional
//!   duration timer.
//! - **Negotiation**: on connection open, either attach the configured link
//!   (active) or acknowledge the connection and wait for the peer (passive).
//!   Peer-initiated receiver links are accepted with our credit window.
//! - **Sending**: whenever credit is available, send until credit runs out
//!   or `message_count` messages have gone out in total.
//! - **Receiving**: count and report each delivery up to `message_count`;
//!   later deliveries are dropped silently.
//! - **Termination**: a single idempotent routine reached from sender
//!   completion (all messages accepted), receiver completion (last message
//!   delivered) or the duration timer.
//!
//! Configuration and mutable run state are kept apart: handlers receive the
//! immutable [`RunConfig`] and the [`RunState`] owned by the event loop.

use std::io::Write;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

use crate::cli::{ChannelMode, ConnectionMode, Operation};
use crate::config::RunConfig;
use crate::engine::{
    ConnectionId, Engine, EngineEvent, Handshake, LinkId, ListenerId, Message, TimerId,
    ANONYMOUS, SEND_TIME_PROPERTY,
};
use crate::error::ArrowError;
use crate::report::Reporter;
use crate::utils::{filler_body, now_millis};

/// Mutable state of one run. Only the event loop touches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub connection: Option<ConnectionId>,
    pub listener: Option<ListenerId>,
    pub timer: Option<TimerId>,
    pub body: Vec<u8>,
    pub start_time: i64,
    pub sent: u64,
    pub received: u64,
    pub accepted: u64,
    pub stopping: bool,
}

impl RunState {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            connection: None,
            listener: None,
            timer: None,
            body: filler_body(config.body_size),
            start_time: 0,
            sent: 0,
            received: 0,
            accepted: 0,
            stopping: false,
        }
    }
}

/// Final counters of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub sent: u64,
    pub received: u64,
    pub accepted: u64,
}

pub struct Driver<E: Engine, W: Write> {
    config: RunConfig,
    state: RunState,
    engine: E,
    reporter: Reporter<W>,
}

impl<E: Engine, W: Write + Send> Driver<E, W> {
    pub fn new(config: RunConfig, engine: E, reporter: Reporter<W>) -> Self {
        let state = RunState::new(&config);
        Self {
            config,
            state,
            engine,
            reporter,
        }
    }

    /// Start the run and process events until the engine has nothing left.
    pub async fn run(&mut self) -> Result<RunSummary, ArrowError> {
        self.start()?;
        self.process().await
    }

    /// Process events of an already started run until the engine is idle.
    pub async fn process(&mut self) -> Result<RunSummary, ArrowError> {
        while let Some(event) = self.engine.next_event().await {
            let handled = self.handle(event);
            self.reporter.flush()?;
            handled?;
        }
        self.reporter.flush()?;

        let summary = self.summary();
        info!(
            "Run finished: {} sent, {} accepted, {} received",
            summary.sent, summary.accepted, summary.received
        );
        Ok(summary)
    }

    /// Open the connection or listener and arm the duration timer.
    pub fn start(&mut self) -> Result<(), ArrowError> {
        let Driver {
            config,
            state,
            engine,
            ..
        } = self;
        start(config, state, engine)
    }

    /// Dispatch one engine event.
    pub fn handle(&mut self, event: EngineEvent) -> Result<(), ArrowError> {
        let Driver {
            config,
            state,
            engine,
            reporter,
        } = self;

        match event {
            EngineEvent::ConnectionOpened { connection } => {
                on_connection_opened(config, state, engine, connection)
            }
            EngineEvent::ConnectionClosed { connection } => {
                on_connection_closed(state, connection);
                Ok(())
            }
            EngineEvent::ReceiverOpenRequested { link, target } => {
                on_receiver_open_requested(config, state, engine, link, &target)
            }
            EngineEvent::Sendable { link, .. } => {
                on_sendable(config, state, engine, reporter, link)
            }
            EngineEvent::Delivered { message, .. } => {
                on_delivered(config, state, engine, reporter, &message)
            }
            EngineEvent::Accepted { .. } => {
                on_accepted(config, state, engine);
                Ok(())
            }
            EngineEvent::TransportError { connection, error } => {
                on_transport_error(config, connection, error)
            }
            EngineEvent::TimerFired { timer } => {
                on_timer(config, state, engine, timer);
                Ok(())
            }
        }
    }

    /// Run the termination routine. Safe to call any number of times.
    pub fn stop(&mut self) {
        stop(&self.config, &mut self.state, &mut self.engine);
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state
            .listener
            .and_then(|listener| self.engine.listener_addr(listener))
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            sent: self.state.sent,
            received: self.state.received,
            accepted: self.state.accepted,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn reporter(&self) -> &Reporter<W> {
        &self.reporter
    }

    pub fn into_reporter(self) -> Reporter<W> {
        self.reporter
    }
}

fn start<E: Engine>(
    config: &RunConfig,
    state: &mut RunState,
    engine: &mut E,
) -> Result<(), ArrowError> {
    let endpoint = config.endpoint();
    // The side that opens links drives the AMQP handshake, even on accepted
    // connections.
    let handshake = match config.channel_mode {
        ChannelMode::Active => Handshake::Initiate,
        ChannelMode::Passive => Handshake::Respond,
    };

    match config.connection_mode {
        ConnectionMode::Client => {
            info!("Connecting to {}", endpoint);
            state.connection = Some(engine.connect(&endpoint, ANONYMOUS, handshake)?);
        }
        ConnectionMode::Server => {
            state.listener = Some(engine.listen(&endpoint, ANONYMOUS, handshake)?);
        }
    }

    state.start_time = now_millis();

    if let Some(deadline) = config.deadline() {
        debug!("Run limited to {:?}", deadline);
        state.timer = Some(engine.schedule(deadline));
    }
    Ok(())
}

fn on_connection_opened<E: Engine>(
    config: &RunConfig,
    state: &mut RunState,
    engine: &mut E,
    connection: ConnectionId,
) -> Result<(), ArrowError> {
    if state.stopping {
        debug!("Closing {} opened after shutdown began", connection);
        engine.close_connection(connection);
        return Ok(());
    }

    state.connection = Some(connection);

    match config.channel_mode {
        ChannelMode::Active => {
            let link = match config.operation {
                Operation::Send => engine.open_sender(connection, &config.link_path)?,
                Operation::Receive => {
                    engine.open_receiver(connection, &config.link_path, config.credit_window)?
                }
            };
            debug!("Opened {} link {} on '{}'", config.operation, link, config.link_path);
        }
        ChannelMode::Passive => {
            engine.open_connection(connection)?;
            debug!("Waiting for the peer to open a link on {}", connection);
        }
    }
    Ok(())
}

fn on_connection_closed(state: &mut RunState, connection: ConnectionId) {
    if state.connection == Some(connection) {
        state.connection = None;
    }
}

fn on_receiver_open_requested<E: Engine>(
    config: &RunConfig,
    state: &RunState,
    engine: &mut E,
    link: LinkId,
    target: &str,
) -> Result<(), ArrowError> {
    if state.stopping {
        return Ok(());
    }
    engine.accept_receiver(link, target, config.credit_window)?;
    Ok(())
}

fn on_sendable<E: Engine, W: Write>(
    config: &RunConfig,
    state: &mut RunState,
    engine: &mut E,
    reporter: &mut Reporter<W>,
    link: LinkId,
) -> Result<(), ArrowError> {
    if config.operation != Operation::Send {
        warn!("Ignoring credit on {} while receiving", link);
        return Ok(());
    }
    if state.stopping {
        return Ok(());
    }

    while engine.credit(link) > 0 && state.sent < config.message_count {
        state.sent += 1;
        let id = state.sent.to_string();
        let send_time = now_millis();

        let mut message = Message::with_body(state.body.clone());
        message.id = Some(id.clone());
        message.durable = config.durable;
        message
            .properties
            .insert(SEND_TIME_PROPERTY.to_string(), send_time);

        engine.send(link, message)?;
        reporter.sent(&id, send_time)?;
    }
    Ok(())
}

fn on_accepted<E: Engine>(config: &RunConfig, state: &mut RunState, engine: &mut E) {
    state.accepted += 1;

    if state.accepted == config.message_count {
        stop(config, state, engine);
    }
}

fn on_delivered<E: Engine, W: Write>(
    config: &RunConfig,
    state: &mut RunState,
    engine: &mut E,
    reporter: &mut Reporter<W>,
    message: &Message,
) -> Result<(), ArrowError> {
    if config.operation != Operation::Receive {
        warn!("Ignoring delivery while sending");
        return Ok(());
    }
    if state.received == config.message_count {
        return Ok(());
    }

    let id = message
        .id
        .as_deref()
        .ok_or_else(|| ArrowError::Protocol("received a message without an id".to_string()))?;
    let send_time = message.send_time().ok_or_else(|| {
        ArrowError::Protocol(format!(
            "message {} has no {} property",
            id, SEND_TIME_PROPERTY
        ))
    })?;

    state.received += 1;
    let receive_time = now_millis();
    reporter.received(id, send_time, receive_time)?;

    if state.received == config.message_count {
        stop(config, state, engine);
    }
    Ok(())
}

fn on_transport_error(
    config: &RunConfig,
    connection: Option<ConnectionId>,
    error: String,
) -> Result<(), ArrowError> {
    if config.is_server() {
        // Listeners get probed by harnesses checking that we are up.
        match connection {
            Some(connection) => warn!("Ignoring transport error on {}: {}", connection, error),
            None => warn!("Ignoring transport error: {}", error),
        }
        return Ok(());
    }
    Err(ArrowError::Transport(error))
}

fn on_timer<E: Engine>(config: &RunConfig, state: &mut RunState, engine: &mut E, timer: TimerId) {
    if state.timer != Some(timer) {
        return;
    }
    state.timer = None;

    info!(
        "Duration of {}s elapsed with {} sent and {} received",
        config.duration_seconds, state.sent, state.received
    );
    stop(config, state, engine);
}

fn stop<E: Engine>(config: &RunConfig, state: &mut RunState, engine: &mut E) {
    if state.stopping {
        return;
    }
    state.stopping = true;
    debug!("Stopping after {}ms", now_millis() - state.start_time);

    if let Some(timer) = state.timer.take() {
        engine.cancel_timer(timer);
    }
    if let Some(connection) = state.connection {
        engine.close_connection(connection);
    }
    if config.is_server() {
        if let Some(listener) = state.listener.take() {
            engine.stop_listener(listener);
        }
    }
}
