//! Communication channel: one TCP socket, its remote address, and the
//! buffer used to stage outgoing and hold incoming messages.
//!
//! A channel is either allocated empty (buffer only), opened toward a
//! destination (unconnected socket), or attached to a socket returned by
//! `accept`. Closing is idempotent.

use crate::error::{Error, Result};
use crate::transport::{recv_frame, send_frame, Buffer, Chunked, Header, Opts, Transfer, Watched};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{debug, trace};

/// A received message. `payload` borrows the channel's buffer and is valid
/// until the next receive or clear on the same channel.
#[derive(Debug)]
pub struct Frame<'a> {
    pub header: Header,
    pub payload: &'a [u8],
    pub transfer: Transfer,
}

/// One end of one TCP connection plus its staging buffer.
#[derive(Debug)]
pub struct CommChannel {
    socket: Option<Socket>,
    remote: Option<SocketAddr>,
    buffer: Buffer,
    /// Cap on bytes per read/write call, for diagnostics.
    chunk_limit: Option<usize>,
    /// Largest payload `recv` accepts; `None` trusts the peer's header.
    max_message: Option<usize>,
}

impl CommChannel {
    /// Allocate a channel with no socket yet.
    pub fn alloc(buffer_size: usize) -> Self {
        Self {
            socket: None,
            remote: None,
            buffer: Buffer::new(buffer_size),
            chunk_limit: None,
            max_message: None,
        }
    }

    /// Point the channel at `remote` and create a fresh, unconnected socket.
    ///
    /// Any socket already held is closed first.
    pub fn open(&mut self, remote: SocketAddr) -> Result<()> {
        self.close();
        let socket = Socket::new(
            Domain::for_address(remote),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        self.socket = Some(socket);
        self.remote = Some(remote);
        Ok(())
    }

    /// Connect the socket created by [`open`](Self::open).
    pub fn connect(&mut self) -> Result<()> {
        let (socket, remote) = match (&self.socket, self.remote) {
            (Some(socket), Some(remote)) => (socket, remote),
            _ => return Err(Error::NotOpen),
        };
        socket.connect(&remote.into())?;
        debug!(remote = %remote, "channel connected");
        Ok(())
    }

    /// Take ownership of an already-connected socket.
    pub(crate) fn attach(&mut self, socket: Socket, remote: Option<SocketAddr>) {
        self.close();
        self.socket = Some(socket);
        self.remote = remote;
    }

    /// Close the socket. Closing a closed channel does nothing.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            trace!(remote = ?self.remote, "channel closed");
            drop(socket);
        }
    }

    /// Replace the socket with a new one toward the same address.
    pub fn reopen(&mut self) -> Result<()> {
        let remote = self.remote.ok_or(Error::NotOpen)?;
        self.open(remote)
    }

    /// Shut down both directions without releasing the socket.
    ///
    /// Subsequent transfers on either end fail, which is how a transport
    /// failure looks to the peer.
    pub fn shutdown(&self) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::NotOpen)?;
        socket.shutdown(Shutdown::Both)?;
        Ok(())
    }

    /// Close the socket and free the buffer, checking its accounting.
    pub fn free(&mut self) -> Result<()> {
        self.close();
        self.buffer.release()
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Remote port, if the channel has an address.
    pub fn port(&self) -> Option<u16> {
        self.remote.map(|addr| addr.port())
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Staging access: `clear()`, write the message, then `send(None, None)`.
    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    pub fn set_chunk_limit(&mut self, limit: Option<usize>) {
        self.chunk_limit = limit;
    }

    /// Refuse incoming messages longer than `limit`.
    ///
    /// Without a limit the receive buffer grows to whatever length the
    /// peer's header announces, up to 4 GiB. A refused payload is left
    /// unread, so the connection should be closed afterwards.
    pub fn set_max_message(&mut self, limit: Option<usize>) {
        self.max_message = limit;
    }

    /// Bound how long a single read may block.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::NotOpen)?;
        socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Send one framed message.
    ///
    /// Sends `payload` when given, otherwise the buffer's staged bytes.
    /// Without a header an ordinary data header is used. A supplied header
    /// keeps its options but always carries the real payload length.
    pub fn send(&mut self, header: Option<Header>, payload: Option<&[u8]>) -> Result<Transfer> {
        let socket = self.socket.as_ref().ok_or(Error::NotOpen)?;
        let data = payload.unwrap_or_else(|| self.buffer.as_slice());
        let msg_len = u32::try_from(data.len()).map_err(|_| Error::MessageTooLarge(data.len()))?;

        let header = match header {
            Some(h) => Header { msg_len, ..h },
            None => Header::data(msg_len),
        };

        let mut stream = Chunked::new(socket, self.chunk_limit);
        send_frame(&mut stream, Some(&header), data)
    }

    /// Send an empty control message carrying `opts`.
    pub fn send_control(&mut self, opts: Opts) -> Result<Transfer> {
        let empty: &[u8] = &[];
        self.send(Some(Header::control(opts)), Some(empty))
    }

    /// Receive one framed message into the buffer.
    pub fn recv(&mut self) -> Result<Frame<'_>> {
        let socket = self.socket.as_ref().ok_or(Error::NotOpen)?;
        let mut stream = Chunked::new(socket, self.chunk_limit);
        let (header, transfer) = recv_frame(&mut stream, &mut self.buffer, self.max_message)?;

        Ok(Frame {
            header,
            payload: self.buffer.as_slice(),
            transfer,
        })
    }

    /// Like [`recv`](Self::recv), but gives up once `stop` is raised.
    ///
    /// Needs a read timeout on the socket; each timeout re-checks `stop`.
    pub fn recv_until(&mut self, stop: &AtomicBool) -> Result<Frame<'_>> {
        let socket = self.socket.as_ref().ok_or(Error::NotOpen)?;
        let mut stream = Watched::new(Chunked::new(socket, self.chunk_limit), stop);
        let (header, transfer) = recv_frame(&mut stream, &mut self.buffer, self.max_message)?;

        Ok(Frame {
            header,
            payload: self.buffer.as_slice(),
            transfer,
        })
    }

    /// Local address of the socket, if it is bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
    }
}

impl Default for CommChannel {
    fn default() -> Self {
        Self::alloc(0)
    }
}
