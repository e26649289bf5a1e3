//! tcp-handoff-server: accept clients on the master port, hand each one off
//! to a worker, and acknowledge every message it sends.

use tcp_handoff::config::Config;
use tcp_handoff::{Server, Session};
use tracing::{debug, info};
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
        listen = %config.listen_addr(),
        handoff = config.handoff,
        mode = %config.mode,
        max_workers = config.max_workers,
        buffer_size = config.buffer_size,
        "Starting tcp-handoff server"
    );

    let mut server = Server::bind(&config)?;
    server.install_signal_handlers()?;
    server.run(acknowledge)?;
    Ok(())
}

/// Reply to each message with a one-line receipt until the peer hangs up.
fn acknowledge(session: &mut Session) -> tcp_handoff::Result<()> {
    let pid = std::process::id();
    loop {
        let len = session.recv()?.len();
        let ntrans = session.ntrans();
        debug!(pid, len, ntrans, "message received");

        let reply = format!("PID {pid} received {len} bytes in {ntrans} transfers");
        session.send(reply.as_bytes())?;
    }
}
