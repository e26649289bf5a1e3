//! Server endpoint: master listener, optional distinct worker listener, and
//! the port-handoff handshake.
//!
//! State flow for one connection:
//!
//! ```text
//! LISTENING(master) -> ACCEPTED(master) -> [WORKER_BOUND -> ACCEPTING(worker)]
//!     -> FORKED_CHILD | FORKED_PARENT (back to LISTENING)
//! ```

use crate::channel::CommChannel;
use crate::error::{Error, Result};
use crate::transport::{Opts, DEFAULT_CAPACITY};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Role bits of a server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    /// Process still responsible for the endpoint (has not forked away).
    pub const PARENT: Flags = Flags(0b0001);
    /// Endpoint owning the well-known listening port.
    pub const MASTER: Flags = Flags(0b0010);
    /// Endpoint whose connection carries data traffic.
    pub const WORKER: Flags = Flags(0b0100);

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Where data traffic goes after the handshake.
#[derive(Debug)]
enum Handoff {
    /// The master's own connection carries the data.
    None,
    /// A second listener on an ephemeral port carries the data.
    Distinct(Box<ServerEndpoint>),
}

/// Outcome of [`ServerEndpoint::accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Handshake done; the data connection is ready on `port`.
    Handoff { port: u16 },
    /// The peer asked the server to shut down.
    Terminate,
    /// The stop flag was raised while waiting for a connection.
    Stopped,
}

/// Outcome of [`ServerEndpoint::fork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Child,
    Parent(libc::pid_t),
}

/// Tunables for listeners and the channels they accept.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub buffer_size: usize,
    pub chunk_limit: Option<usize>,
    /// Largest message a channel will receive.
    pub max_message: Option<usize>,
    pub backlog: i32,
    /// How often a blocked accept wakes up to check the stop flag.
    pub accept_poll: Duration,
}

impl EndpointOptions {
    fn channel(&self) -> CommChannel {
        let mut channel = CommChannel::alloc(self.buffer_size);
        channel.set_chunk_limit(self.chunk_limit);
        channel.set_max_message(self.max_message);
        channel
    }
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_CAPACITY,
            chunk_limit: None,
            max_message: None,
            backlog: 16,
            accept_poll: Duration::from_millis(250),
        }
    }
}

/// Listening side of the protocol.
#[derive(Debug)]
pub struct ServerEndpoint {
    flags: Flags,
    ip: IpAddr,
    /// Bound port (the OS-assigned one when constructed with port 0).
    port: u16,
    listener: Option<Socket>,
    /// Connection accepted on `listener`.
    channel: CommChannel,
    ntrans: usize,
    handoff: Handoff,
    stop: Arc<AtomicBool>,
    options: EndpointOptions,
}

impl ServerEndpoint {
    /// Bind and listen on `addr`, with a distinct worker endpoint when
    /// `distinct_worker` is set.
    pub fn new(addr: SocketAddr, distinct_worker: bool) -> Result<Self> {
        Self::with_options(addr, distinct_worker, EndpointOptions::default())
    }

    pub fn with_options(
        addr: SocketAddr,
        distinct_worker: bool,
        options: EndpointOptions,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut endpoint = Self::construct(addr, options.clone(), Arc::clone(&stop))?;

        if distinct_worker {
            let mut worker = Self::construct(SocketAddr::new(addr.ip(), 0), options, stop)?;
            worker.flags.remove(Flags::MASTER);
            worker.flags.insert(Flags::WORKER);
            debug!(port = worker.port, "worker endpoint listening");
            endpoint.handoff = Handoff::Distinct(Box::new(worker));
        } else {
            endpoint.flags.insert(Flags::WORKER);
        }

        info!(
            port = endpoint.port,
            distinct_worker, "server endpoint listening"
        );
        Ok(endpoint)
    }

    fn construct(addr: SocketAddr, options: EndpointOptions, stop: Arc<AtomicBool>) -> Result<Self> {
        let channel = options.channel();
        let mut endpoint = Self {
            flags: Flags::PARENT | Flags::MASTER,
            ip: addr.ip(),
            port: addr.port(),
            listener: None,
            channel,
            ntrans: 0,
            handoff: Handoff::None,
            stop,
            options,
        };
        endpoint.open_listener(addr.port())?;
        Ok(endpoint)
    }

    /// Open, bind and listen; records the port actually bound.
    fn open_listener(&mut self, port: u16) -> Result<()> {
        let addr = SocketAddr::new(self.ip, port);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.options.backlog)?;
        // A receive timeout on the listener bounds how long accept blocks.
        socket.set_read_timeout(Some(self.options.accept_poll))?;

        self.port = socket
            .local_addr()?
            .as_socket()
            .map(|a| a.port())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "listener has no inet address"))?;
        self.listener = Some(socket);
        Ok(())
    }

    /// Wait for one connection on this endpoint's listener.
    ///
    /// Returns `false` if the stop flag was raised first.
    fn accept_connection(&mut self) -> Result<bool> {
        let listener = self.listener.as_ref().ok_or(Error::NotOpen)?;
        loop {
            match listener.accept() {
                Ok((socket, peer)) => {
                    socket.set_read_timeout(None).map_err(Error::Accept)?;
                    self.channel.attach(socket, peer.as_socket());
                    debug!(port = self.port, peer = ?self.channel.remote(), "accepted connection");
                    return Ok(true);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    if self.stop.load(Ordering::SeqCst) {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(Error::Accept(e)),
            }
        }
    }

    /// Accept one client on the master port and run the handoff handshake.
    ///
    /// The first message must be an empty `REQ_WPORT` request (answered with
    /// the data port) or an empty `SIGTERM` request (raises the stop flag).
    /// Anything else is a protocol violation.
    ///
    /// While waiting for that first message the stop flag is still checked
    /// every `accept_poll`, so a silent client cannot hold up shutdown.
    pub fn accept(&mut self) -> Result<Accepted> {
        if !self.flags.contains(Flags::MASTER) {
            return Err(Error::NotMaster);
        }
        if !self.accept_connection()? {
            return Ok(Accepted::Stopped);
        }

        let stop = Arc::clone(&self.stop);
        self.channel.set_read_timeout(Some(self.options.accept_poll))?;
        let received = self
            .channel
            .recv_until(&stop)
            .map(|frame| (frame.header.opts, frame.payload.len(), frame.transfer.calls));
        let (opts, len, calls) = match received {
            Ok(handshake) => handshake,
            Err(_) if self.is_stopped() => {
                debug!(peer = ?self.channel.remote(), "stopped while awaiting handshake");
                self.channel.close();
                return Ok(Accepted::Stopped);
            }
            Err(e) => return Err(e),
        };
        self.ntrans = calls;

        if opts == Opts::REQ_WPORT && len == 0 {
            self.channel.set_read_timeout(None)?;
            let port = self.grant_worker_port()?;
            let reply = self.channel.send(None, Some(&port.to_be_bytes()[..]))?;
            self.ntrans += reply.calls;

            if let Handoff::Distinct(worker) = &mut self.handoff {
                if !worker.accept_connection()? {
                    return Ok(Accepted::Stopped);
                }
            }
            debug!(port, "handoff complete");
            Ok(Accepted::Handoff { port })
        } else if opts == Opts::SIGTERM && len == 0 {
            info!(peer = ?self.channel.remote(), "termination requested by peer");
            self.channel.close();
            self.request_stop();
            Ok(Accepted::Terminate)
        } else {
            warn!(opts = opts.bits(), len, "protocol violation on master port");
            self.channel.close();
            if len != 0 && (opts == Opts::REQ_WPORT || opts == Opts::SIGTERM) {
                Err(Error::UnexpectedPayload {
                    opts: opts.bits(),
                    len,
                })
            } else {
                Err(Error::UnexpectedOpts(opts.bits()))
            }
        }
    }

    /// Port the client should use for data, (re)opening the worker listener
    /// if the last fork closed it.
    fn grant_worker_port(&mut self) -> Result<u16> {
        match &mut self.handoff {
            Handoff::None => Ok(self.port),
            Handoff::Distinct(worker) => {
                if worker.listener.is_none() {
                    worker.open_listener(0)?;
                    debug!(port = worker.port, "worker endpoint reopened");
                }
                Ok(worker.port)
            }
        }
    }

    /// Fork the process after a successful handoff.
    ///
    /// The child owns the live connection and drops the listeners; the
    /// parent drops the connection and goes back to accepting.
    ///
    /// Forking a multi-threaded process only carries the calling thread into
    /// the child; call this from the accept-loop thread.
    pub fn fork(&mut self) -> Result<Fork> {
        // SAFETY: fork has no memory-safety preconditions; the child only
        // continues on this thread with state it owns.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(Error::Fork(io::Error::last_os_error())),
            0 => {
                self.become_child();
                Ok(Fork::Child)
            }
            pid => {
                self.release_connection();
                Ok(Fork::Parent(pid))
            }
        }
    }

    fn become_child(&mut self) {
        self.flags.remove(Flags::PARENT);
        self.listener = None;
        if let Handoff::Distinct(worker) = &mut self.handoff {
            worker.flags.remove(Flags::PARENT);
            worker.listener = None;
            // Handshake connection on the master is no longer needed.
            self.channel.close();
        }
    }

    /// Drop the connection just handed to a worker unit.
    ///
    /// With a distinct worker its listener closes too, so the next accept
    /// binds a fresh ephemeral port.
    pub(crate) fn release_connection(&mut self) {
        self.channel.close();
        if let Handoff::Distinct(worker) = &mut self.handoff {
            worker.listener = None;
            worker.channel.close();
        }
    }

    /// Move the live data connection out into a [`Session`].
    ///
    /// Leaves the endpoint ready for the next `accept`.
    pub fn detach(&mut self) -> Session {
        let fresh = self.options.channel();
        let worker = self.worker_mut();
        let channel = std::mem::replace(&mut worker.channel, fresh);

        self.release_connection();
        Session { channel, ntrans: 0 }
    }

    fn worker_mut(&mut self) -> &mut ServerEndpoint {
        match self.handoff {
            Handoff::Distinct(ref mut worker) => &mut **worker,
            Handoff::None => self,
        }
    }

    fn worker(&self) -> &ServerEndpoint {
        match &self.handoff {
            Handoff::Distinct(worker) => &**worker,
            Handoff::None => self,
        }
    }

    /// Send `payload` on the data connection.
    pub fn send(&mut self, payload: &[u8]) -> Result<usize> {
        let worker = self.worker_mut();
        let transfer = worker.channel.send(None, Some(payload))?;
        worker.ntrans = transfer.calls;
        Ok(transfer.bytes)
    }

    /// Send whatever is staged in the data connection's buffer.
    pub fn send_staged(&mut self) -> Result<usize> {
        let worker = self.worker_mut();
        let transfer = worker.channel.send(None, None)?;
        worker.ntrans = transfer.calls;
        Ok(transfer.bytes)
    }

    /// Receive one message on the data connection.
    pub fn recv(&mut self) -> Result<&[u8]> {
        let worker = self.worker_mut();
        let frame = worker.channel.recv()?;
        worker.ntrans = frame.transfer.calls;
        Ok(frame.payload)
    }

    /// Transfer calls used by the last data-connection operation.
    pub fn ntrans(&self) -> usize {
        self.worker().ntrans
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Port of the distinct worker listener, when one is configured and open.
    pub fn worker_port(&self) -> Option<u16> {
        match &self.handoff {
            Handoff::Distinct(worker) if worker.listener.is_some() => Some(worker.port),
            _ => None,
        }
    }

    pub fn has_distinct_worker(&self) -> bool {
        matches!(self.handoff, Handoff::Distinct(_))
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn is_parent(&self) -> bool {
        self.flags.contains(Flags::PARENT)
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Shared flag that makes blocked accepts return [`Accepted::Stopped`].
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Close listeners and connections, worker included. Idempotent.
    pub fn close(&mut self) {
        self.listener = None;
        self.channel.close();
        if let Handoff::Distinct(worker) = &mut self.handoff {
            worker.close();
        }
    }

    /// Close everything and release buffers, checking their accounting.
    ///
    /// Freeing twice is a no-op.
    pub fn free(&mut self) -> Result<()> {
        self.close();
        self.channel.free()?;
        if let Handoff::Distinct(worker) = &mut self.handoff {
            worker.free()?;
        }
        Ok(())
    }
}

/// A data connection owned by one worker unit.
#[derive(Debug)]
pub struct Session {
    channel: CommChannel,
    ntrans: usize,
}

impl Session {
    pub fn send(&mut self, payload: &[u8]) -> Result<usize> {
        let transfer = self.channel.send(None, Some(payload))?;
        self.ntrans = transfer.calls;
        Ok(transfer.bytes)
    }

    pub fn send_staged(&mut self) -> Result<usize> {
        let transfer = self.channel.send(None, None)?;
        self.ntrans = transfer.calls;
        Ok(transfer.bytes)
    }

    pub fn recv(&mut self) -> Result<&[u8]> {
        let frame = self.channel.recv()?;
        self.ntrans = frame.transfer.calls;
        Ok(frame.payload)
    }

    pub fn channel_mut(&mut self) -> &mut CommChannel {
        &mut self.channel
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.channel.remote()
    }

    pub fn ntrans(&self) -> usize {
        self.ntrans
    }

    pub fn close(&mut self) {
        self.channel.close();
    }
}
