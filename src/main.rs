//! echomux: a readiness-driven TCP/UDP echo server.
//!
//! One thread multiplexes the TCP listener, every accepted connection, and
//! the UDP endpoint over a single kernel poll. Each byte received is
//! written straight back to its sender: streams echo verbatim with no
//! framing, datagrams echo one reply per received packet.

mod config;
mod runtime;

use config::Config;
use runtime::{EchoServer, ShutdownHandle};
use std::sync::OnceLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

static SHUTDOWN: OnceLock<ShutdownHandle> = OnceLock::new();

/// Sets the stop flag and writes one byte to the poller's self-pipe, both
/// async-signal-safe, so the loop stops even if the signal lands while it
/// is busy between waits.
extern "C" fn on_signal(_signal: libc::c_int) {
    if let Some(handle) = SHUTDOWN.get() {
        handle.shutdown();
    }
}

fn install_signal_handlers() {
    let handler = on_signal as *const () as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

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
        transport = ?config.transport,
        buffer_size = config.buffer_size,
        max_connections = config.max_connections,
        "Starting echomux server"
    );

    // Socket or bind failure here aborts before the loop starts.
    let mut server = EchoServer::bind(&config)?;

    let _ = SHUTDOWN.set(server.shutdown_handle());
    install_signal_handlers();

    server.run()?;

    info!("Shutdown complete");
    Ok(())
}
