//! Error types shared by the engine and the driver.

use thiserror::Error;

use crate::engine::{ConnectionId, LinkId};

/// Failures raised by protocol-engine commands.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("unknown link {0}")]
    UnknownLink(LinkId),

    #[error("no credit available on link {0}")]
    NoCredit(LinkId),

    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("SASL mechanism {0} is not supported")]
    UnsupportedMechanism(String),

    /// Links are only attached by the side that initiated the AMQP handshake.
    #[error("connection {0} responded to the AMQP handshake and cannot attach links")]
    NotInitiator(ConnectionId),

    #[error("failed to listen on {endpoint}: {source}")]
    Listen {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures that end a benchmark run.
#[derive(Debug, Error)]
pub enum ArrowError {
    #[error("This impl doesn't support transactions")]
    UnsupportedTransactions,

    /// A transport failure surfaced while running as a client.
    #[error("{0}")]
    Transport(String),

    /// A peer sent something the driver cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to write report: {0}")]
    Report(#[from] std::io::Error),
}
