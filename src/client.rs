//! Client endpoint: master connection, optional worker connection, and the
//! client half of the port-handoff handshake.

use crate::channel::CommChannel;
use crate::error::{Error, Result};
use crate::transport::{Buffer, Opts, DEFAULT_CAPACITY};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use tracing::{debug, info};

/// What to ask the server for when connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Request a worker port and open the data connection.
    Handoff,
    /// Ask the server to shut down.
    Terminate,
}

/// Connecting side of the protocol.
///
/// Data flows over the worker connection when the server granted a distinct
/// port, and over the master connection otherwise.
#[derive(Debug)]
pub struct ClientEndpoint {
    name: String,
    host: IpAddr,
    port: u16,
    master: CommChannel,
    /// `None` while the master connection carries data.
    worker: Option<CommChannel>,
    ntrans: usize,
    buffer_size: usize,
    chunk_limit: Option<usize>,
}

impl ClientEndpoint {
    /// Resolve `server_name` and open (but do not connect) the master channel.
    pub fn new(server_name: &str, port: u16) -> Result<Self> {
        Self::with_buffer_size(server_name, port, DEFAULT_CAPACITY)
    }

    pub fn with_buffer_size(server_name: &str, port: u16, buffer_size: usize) -> Result<Self> {
        let host = resolve(server_name, port)?;
        let mut master = CommChannel::alloc(buffer_size);
        master.open(SocketAddr::new(host, port))?;

        Ok(Self {
            name: server_name.to_string(),
            host,
            port,
            master,
            worker: None,
            ntrans: 0,
            buffer_size,
            chunk_limit: None,
        })
    }

    /// Connect the master channel and run the requested handshake.
    pub fn connect(&mut self, request: Request) -> Result<()> {
        self.master.connect()?;
        match request {
            Request::Handoff => self.connect_worker(),
            Request::Terminate => {
                let transfer = self.master.send_control(Opts::SIGTERM)?;
                self.ntrans = transfer.calls;
                info!(server = %self.name, "termination request sent");
                Ok(())
            }
        }
    }

    /// Ask for the data port over the master channel.
    fn request_worker_port(&mut self) -> Result<u16> {
        let sent = self.master.send_control(Opts::REQ_WPORT)?;
        let frame = self.master.recv()?;
        self.ntrans = sent.calls + frame.transfer.calls;

        match *frame.payload {
            [hi, lo] => Ok(u16::from_be_bytes([hi, lo])),
            ref other => Err(Error::BadPortReply(other.len())),
        }
    }

    fn connect_worker(&mut self) -> Result<()> {
        let port = self.request_worker_port()?;

        if port == self.port {
            if let Some(mut old) = self.worker.take() {
                old.close();
            }
            debug!(port, "server kept data on the master connection");
            return Ok(());
        }

        let buffer_size = self.buffer_size;
        let chunk_limit = self.chunk_limit;
        let worker = self.worker.get_or_insert_with(|| {
            let mut channel = CommChannel::alloc(buffer_size);
            channel.set_chunk_limit(chunk_limit);
            channel
        });
        worker.open(SocketAddr::new(self.host, port))?;
        worker.connect()?;
        debug!(port, "connected to worker port");
        Ok(())
    }

    /// Replace the sockets and run the handoff again.
    ///
    /// Recovers from a transport failure on either connection.
    pub fn reconnect(&mut self) -> Result<()> {
        if let Some(worker) = &mut self.worker {
            worker.reopen()?;
        }
        self.master.reopen()?;
        self.connect(Request::Handoff)
    }

    /// Ask the server to shut down over a fresh master connection.
    pub fn send_terminate(&mut self) -> Result<()> {
        self.close();
        self.open()?;
        self.connect(Request::Terminate)
    }

    /// Create a new, unconnected master socket.
    pub fn open(&mut self) -> Result<()> {
        self.master.open(SocketAddr::new(self.host, self.port))
    }

    /// Close both connections. Idempotent.
    pub fn close(&mut self) {
        if let Some(worker) = &mut self.worker {
            worker.close();
        }
        self.master.close();
    }

    fn data(&self) -> &CommChannel {
        self.worker.as_ref().unwrap_or(&self.master)
    }

    fn data_mut(&mut self) -> &mut CommChannel {
        match self.worker {
            Some(ref mut worker) => worker,
            None => &mut self.master,
        }
    }

    /// Send `payload` on the data connection; returns bytes written.
    pub fn send(&mut self, payload: &[u8]) -> Result<usize> {
        let transfer = self.data_mut().send(None, Some(payload))?;
        self.ntrans = transfer.calls;
        Ok(transfer.bytes)
    }

    /// Send whatever is staged in the data connection's buffer.
    pub fn send_staged(&mut self) -> Result<usize> {
        let transfer = self.data_mut().send(None, None)?;
        self.ntrans = transfer.calls;
        Ok(transfer.bytes)
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        self.data_mut().buffer_mut()
    }

    /// Receive one message on the data connection.
    pub fn recv(&mut self) -> Result<&[u8]> {
        let channel = match self.worker {
            Some(ref mut worker) => worker,
            None => &mut self.master,
        };
        let frame = channel.recv()?;
        self.ntrans = frame.transfer.calls;
        Ok(frame.payload)
    }

    /// Transfer calls used by the last operation.
    pub fn ntrans(&self) -> usize {
        self.ntrans
    }

    /// Channel currently carrying data.
    pub fn channel(&self) -> &CommChannel {
        self.data()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn worker_port(&self) -> Option<u16> {
        self.worker.as_ref().and_then(CommChannel::port)
    }

    pub fn has_distinct_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn set_chunk_limit(&mut self, limit: Option<usize>) {
        self.chunk_limit = limit;
        self.master.set_chunk_limit(limit);
        if let Some(worker) = &mut self.worker {
            worker.set_chunk_limit(limit);
        }
    }

    /// Close both connections and release their buffers.
    pub fn free(&mut self) -> Result<()> {
        self.close();
        if let Some(worker) = &mut self.worker {
            worker.free()?;
        }
        self.master.free()
    }
}

/// First address for `name`, preferring IPv4.
fn resolve(name: &str, port: u16) -> Result<IpAddr> {
    let addrs: Vec<SocketAddr> = (name, port)
        .to_socket_addrs()
        .map_err(|_| Error::Resolve(name.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip())
        .ok_or_else(|| Error::Resolve(name.to_string()))
}
