//! # Quiver Arrow
//!
//! A messaging micro-benchmark driver. One process opens a single AMQP 1.0
//! connection, as client or server, and a single link on it, as sender or
//! receiver. It then moves a fixed number of messages as fast as credit-based
//! flow control allows. Every message produces one CSV line on stdout so a
//! harness can compute latency and throughput afterwards.
//!
//! ## Architecture Overview
//!
//! - `cli`: positional command line parsed with clap
//! - `config`: the immutable run configuration
//! - `engine`: the protocol engine abstraction and the built-in AMQP engine
//! - `driver`: the event handlers that implement the benchmark
//! - `report`: CSV output
//! - `logging`: stderr diagnostics
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use quiver_arrow::{AmqpEngine, Args, Driver, Reporter, RunConfig};
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = Args::parse_from([
//!         "quiver-arrow", "client", "active", "send", "arrow-1",
//!         "127.0.0.1", "5672", "q0", "0", "1000", "100", "100", "0",
//!     ]);
//!     let config = RunConfig::from_args(&args)?;
//!     let engine = AmqpEngine::new(config.container_id.clone());
//!
//!     let mut driver = Driver::new(config, engine, Reporter::stdout());
//!     let summary = driver.run().await?;
//!     eprintln!("sent {}", summary.sent);
//!     Ok(())
//! }
//! ```

/// Command-line interface
///
/// Thirteen positional arguments plus an optional flags list. Mode values
/// are closed enumerations validated by clap.
pub mod cli;

/// Run configuration derived from the command line
pub mod config;

/// The benchmark itself
///
/// Startup, link negotiation, credit-driven sending, receiving and the
/// idempotent termination routine all live here, as handlers over a single
/// event loop.
pub mod driver;

/// Protocol engine abstraction
///
/// Contains the `Engine` trait the driver talks to, the event vocabulary it
/// reacts to, and `AmqpEngine`, which speaks AMQP 1.0 over TCP through
/// `fe2o3-amqp`.
pub mod engine;

pub mod error;
pub mod logging;
pub mod report;
pub mod utils;

pub use cli::{Args, ChannelMode, ConnectionMode, Operation};
pub use config::RunConfig;
pub use driver::{Driver, RunState, RunSummary};
pub use engine::{AmqpEngine, Engine, EngineEvent, Handshake, Message};
pub use error::{ArrowError, EngineError};
pub use report::Reporter;

/// The current version, as declared in Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Implementation name reported by the no-argument version probe
pub const IMPL_NAME: &str = "quiver-arrow-rust";
