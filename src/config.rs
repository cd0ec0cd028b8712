//! Resolved run parameters.
//!
//! [`RunConfig`] is built once from the parsed [`Args`] and never changes
//! afterwards. The three mode enums were already closed by clap, so the only
//! remaining validation is the transaction size.

use std::time::Duration;

use crate::cli::{Args, ChannelMode, ConnectionMode, Operation};
use crate::engine::Endpoint;
use crate::error::ArrowError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub connection_mode: ConnectionMode,
    pub channel_mode: ChannelMode,
    pub operation: Operation,
    pub container_id: String,
    pub host: String,
    pub port: u16,
    pub link_path: String,
    pub duration_seconds: u64,
    pub message_count: u64,
    pub body_size: usize,
    pub credit_window: u32,
    pub durable: bool,
}

impl RunConfig {
    /// Build the configuration, refusing any transactional run.
    pub fn from_args(args: &Args) -> Result<Self, ArrowError> {
        if args.transaction_size > 0 {
            return Err(ArrowError::UnsupportedTransactions);
        }

        Ok(Self {
            connection_mode: args.connection_mode,
            channel_mode: args.channel_mode,
            operation: args.operation,
            container_id: args.container_id.clone(),
            host: args.host.clone(),
            port: args.port,
            link_path: args.path.clone(),
            duration_seconds: args.duration_seconds,
            message_count: args.message_count,
            body_size: args.body_size,
            credit_window: args.credit_window,
            durable: args.durable(),
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Hard deadline for the run, if one was requested.
    pub fn deadline(&self) -> Option<Duration> {
        (self.duration_seconds > 0).then(|| Duration::from_secs(self.duration_seconds))
    }

    pub fn is_server(&self) -> bool {
        self.connection_mode == ConnectionMode::Server
    }
}
