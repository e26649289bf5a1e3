//! tcp-handoff-client: send generated payloads to a tcp-handoff server from
//! one or more threads, or ask it to shut down.

use clap::Parser;
use std::process::ExitCode;
use std::thread;
use tcp_handoff::{ClientEndpoint, Request, PORTNO};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "tcp-handoff-client")]
#[command(version)]
#[command(about = "Send framed messages to a tcp-handoff server", long_about = None)]
struct Args {
    /// Server host name or address
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server master port
    #[arg(short, long, default_value_t = PORTNO)]
    port: u16,

    /// Payload size in KiB
    #[arg(short, long, default_value_t = 1024)]
    size: usize,

    /// Number of concurrent connections
    #[arg(short, long, default_value_t = 1)]
    threads: usize,

    /// Ask the server to shut down instead of sending data
    #[arg(long)]
    shutdown: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if args.shutdown {
        return exit_code(shutdown(&args));
    }

    let handles: Vec<_> = (0..args.threads.max(1))
        .map(|id| {
            let host = args.host.clone();
            let (port, size) = (args.port, args.size);
            thread::Builder::new()
                .name(format!("client-{id}"))
                .spawn(move || transfer(id, &host, port, size))
        })
        .collect();

    let mut code = ExitCode::SUCCESS;
    for handle in handles {
        let result = match handle.map(|h| h.join()) {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!("client thread panicked");
                code = ExitCode::FAILURE;
                continue;
            }
            Err(e) => Err(e.into()),
        };
        if result.is_err() {
            code = exit_code(result);
        }
    }
    code
}

fn shutdown(args: &Args) -> tcp_handoff::Result<()> {
    let mut client = ClientEndpoint::new(&args.host, args.port)?;
    client.connect(Request::Terminate)?;
    info!(host = %args.host, port = args.port, "shutdown requested");
    client.free()
}

/// Connect, send `size_kib` KiB and print the server's receipt.
fn transfer(id: usize, host: &str, port: u16, size_kib: usize) -> tcp_handoff::Result<()> {
    let mut client = ClientEndpoint::new(host, port)?;
    client.connect(Request::Handoff)?;

    let payload: Vec<u8> = (0..size_kib * 1024).map(|i| (i % 251) as u8).collect();
    let sent = client.send(&payload)?;
    info!(client = id, bytes = sent, ntrans = client.ntrans(), "payload sent");

    let reply = String::from_utf8_lossy(client.recv()?).into_owned();
    info!(client = id, worker_port = ?client.worker_port(), reply = %reply, "server replied");

    client.free()
}

/// Map a failure to the OS error code when there is one.
fn exit_code(result: tcp_handoff::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "client failed");
            let code = e.raw_os_error().unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
