use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Quiver Arrow - send or receive a fixed number of messages as fast as
/// flow control allows, printing per-message timings as CSV
#[derive(Parser, Debug, Clone)]
#[clap(name = "quiver-arrow", version, about, long_about = None)]
pub struct Args {
    /// Whether to dial out or accept an inbound connection
    #[clap(value_enum)]
    pub connection_mode: ConnectionMode,

    /// Whether this process opens the link or waits for the peer to open it
    #[clap(value_enum)]
    pub channel_mode: ChannelMode,

    /// Direction of message flow on the link
    #[clap(value_enum)]
    pub operation: Operation,

    /// Container identifier announced to the peer
    pub container_id: String,

    /// Host to connect to or listen on
    pub host: String,

    /// Port to connect to or listen on
    pub port: u16,

    /// Link address (queue or topic path)
    pub path: String,

    /// Stop after this many seconds regardless of progress (0 disables)
    pub duration_seconds: u64,

    /// Number of messages to send or receive
    pub message_count: u64,

    /// Size of the filler body in bytes
    pub body_size: usize,

    /// Credit the receiver grants the sender
    pub credit_window: u32,

    /// Messages per transaction (must be 0)
    pub transaction_size: i64,

    /// Comma-separated flags; `durable` marks messages durable
    #[clap(default_value = "")]
    pub flags: String,
}

impl Args {
    /// Split the flags argument into its tokens, skipping empty ones.
    pub fn flag_tokens(&self) -> impl Iterator<Item = &str> {
        self.flags
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn durable(&self) -> bool {
        self.flag_tokens().any(|token| token == "durable")
    }
}

/// Whether this process dials out or listens
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ConnectionMode {
    #[clap(name = "client")]
    Client,

    #[clap(name = "server")]
    Server,
}

/// Whether this process opens the link itself
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ChannelMode {
    #[clap(name = "active")]
    Active,

    #[clap(name = "passive")]
    Passive,
}

/// Direction of message flow
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Operation {
    #[clap(name = "send")]
    Send,

    #[clap(name = "receive")]
    Receive,
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::Client => write!(f, "client"),
            ConnectionMode::Server => write!(f, "server"),
        }
    }
}

impl std::fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelMode::Active => write!(f, "active"),
            ChannelMode::Passive => write!(f, "passive"),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Send => write!(f, "send"),
            Operation::Receive => write!(f, "receive"),
        }
    }
}

/// First line of a clap error with its own `error: ` prefix removed, so it
/// can be reported under the process's diagnostic prefix.
pub fn describe_parse_error(error: &clap::Error) -> String {
    let rendered = error.to_string();
    let first = rendered.lines().next().unwrap_or_default();
    first.strip_prefix("error: ").unwrap_or(first).to_string()
}
