//! tcp-handoff: length-framed TCP messaging with master-to-worker port
//! handoff.
//!
//! A client connects to the server's well-known master port and asks for a
//! worker port. The server answers with a freshly bound ephemeral port (or
//! its own port when handoff is disabled), accepts the client there, and
//! hands the connection to an isolated worker unit so the master goes
//! straight back to accepting.
//!
//! Every message on the wire is a 5-byte header followed by its payload:
//!
//! ```text
//! [ msg_len: u32 big-endian | opts: u8 ][ payload: msg_len bytes ]
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod transport;

pub use channel::{CommChannel, Frame};
pub use client::{ClientEndpoint, Request};
pub use config::Config;
pub use error::{Error, Result};
pub use server::{Accepted, Server, ServerEndpoint, Session, WorkerMode};
pub use transport::{Buffer, Header, Opts, Transfer};

/// Default master port.
pub const PORTNO: u16 = 51717;

/// Default bound on simultaneously live workers.
pub const MAX_WORKER: usize = 7;
