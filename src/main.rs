//! # Quiver Arrow - Main Entry Point
//!
//! 1. **Version probe**: with no arguments at all, print the implementation
//!    name and version and exit successfully.
//! 2. **Parse arguments**: any parse failure is a diagnostic and exit 1.
//! 3. **Initialize logging**: diagnostics go to stderr, stdout is CSV only.
//! 4. **Run**: build the configuration, start the engine and drive it until
//!    the run ends.
//!
//! ## Exit Codes
//!
//! `0` on success (including the version probe), `1` on any fatal error.

use std::process::ExitCode;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use quiver_arrow::{
    cli::{describe_parse_error, Args},
    logging, AmqpEngine, Driver, Reporter, RunConfig, IMPL_NAME, VERSION,
};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> ExitCode {
    if std::env::args_os().len() == 1 {
        println!("{} {}", IMPL_NAME, VERSION);
        return ExitCode::SUCCESS;
    }

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
            _ => {
                eprintln!("{}", logging::fatal_line(describe_parse_error(&e)));
                return ExitCode::FAILURE;
            }
        },
    };

    logging::init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", logging::fatal_line(format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    debug!("Arguments: {:?}", args);
    let config = RunConfig::from_args(&args)?;

    info!(
        "Starting {} {} {} as '{}' on {}",
        config.connection_mode,
        config.channel_mode,
        config.operation,
        config.container_id,
        config.endpoint()
    );

    let engine = AmqpEngine::new(config.container_id.clone());
    let mut driver = Driver::new(config, engine, Reporter::stdout());
    driver.run().await?;
    Ok(())
}
