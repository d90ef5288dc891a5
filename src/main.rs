//! aesdsocket: a line-oriented TCP echo-append server
//!
//! Every newline-terminated packet a client sends is appended to a shared
//! data file, and the full file is sent back to that client. A timer
//! appends a timestamp record every interval.
//!
//! Features:
//! - One thread per connection, all appends and replays serialized
//! - Clean shutdown on SIGINT/SIGTERM, data file removed on exit
//! - Optional daemon mode (`-d`) after the socket is listening
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod daemon;
mod logging;
mod registry;
mod server;
mod shutdown;
mod signal;
mod storage;
mod timer;

use config::Config;
use server::{Listener, Server};
use shutdown::Shutdown;
use signal::TerminationSignals;
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> ExitCode {
    // Load configuration; logging is not up yet, so report to the terminal
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("aesdsocket: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    logging::init(&config);

    match run(config) {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Fatal error, exiting");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        data_file = %config.data_file.display(),
        daemon = config.daemon,
        interval_secs = config.timestamp_interval.as_secs(),
        "Starting aesdsocket"
    );

    // Block before anything can spawn a thread so every thread inherits it.
    let signals = TerminationSignals::block()?;

    let listener = Listener::bind(config.listen, config.backlog)?;

    if config.daemon {
        daemon::detach()?;
    }

    let shutdown = Shutdown::new();
    signals.spawn_listener(shutdown.clone())?;

    Server::new(listener, config, shutdown).run()?;
    Ok(())
}
