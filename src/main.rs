//! frame-echo: a length-prefixed echo server
//!
//! The server multiplexes every client connection on one thread with a
//! readiness-polling loop:
//! - Requests and replies are a 4-byte little-endian length plus payload
//! - Each reply is `"Echo: "` followed by the request payload
//! - Connections are kept alive across any number of exchanges
//! - A fixed-size, descriptor-indexed table bounds the connection count
//!
//! The `client` subcommand is a line-driven harness for talking to it.

mod client;
mod config;
mod protocols;
mod runtime;

use clap::Parser;
use config::{CliArgs, Command, Config, DEFAULT_LOG_LEVEL};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    match cli.command {
        Command::Serve(args) => {
            let config = Config::load(&args, cli.log_level)?;
            init_logging(&config.log_level);

            info!(
                host = %config.host,
                port = config.port,
                max_connections = config.max_connections,
                poll_timeout_ms = config.poll_timeout_ms,
                max_payload = config.max_payload,
                "Starting frame-echo server"
            );

            runtime::run(config)?;
        }
        Command::Client(args) => {
            init_logging(cli.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL));

            let (host, port) = args.endpoint();
            client::run(&host, port)?;
        }
    }

    Ok(())
}

/// Initialize logging to stderr; `RUST_LOG` overrides the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
