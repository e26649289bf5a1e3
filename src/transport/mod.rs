//! Framed, reliable transfer over byte streams.
//!
//! - `Buffer`: growable staging area owned by a channel
//! - `Header`: the 5-byte frame header
//! - `send_all`/`recv_all`: drive partial reads/writes to completion
//! - `Chunked`/`Watched`: stream adapters for call caps and stoppable reads

mod buffer;
mod header;
mod transfer;

pub use buffer::{Buffer, DEFAULT_CAPACITY};
pub use header::{Header, Opts};
pub use transfer::{
    recv_all, recv_frame, recv_header, send_all, send_frame, Chunked, Transfer, Watched,
};
