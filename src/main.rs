//! dup-server: a flow-controlled line duplication server.
//!
//! Protocol: a request is a repeat count line followed by a text line; the
//! response is the text repeated that many times, then a blank line.
//!
//! ```text
//! printf '3\nhi\n' | nc localhost 5003
//! ```
//!
//! Features:
//! - Demand-driven reads: input is requested only between responses
//! - Write watermarks: a slow consumer pauses production instead of
//!   growing buffers
//! - Optional jittered inter-chunk delay to emulate a slow producer
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        delay_ms = config.delay_ms,
        delay_jitter_ms = config.delay_jitter_ms,
        lines_per_chunk = config.lines_per_chunk,
        max_line_len = config.max_line_len,
        "Starting dup-server"
    );

    let server = runtime::Server::bind(config)?;
    server.run()?;

    Ok(())
}
