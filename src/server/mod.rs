//! Server side: endpoint handshake, admission control and the accept loop.

mod admission;
mod endpoint;
mod reaper;

pub use admission::{AdmissionControl, WorkerExit, WorkerMode};
pub use endpoint::{Accepted, EndpointOptions, Flags, Fork, ServerEndpoint, Session};
pub use reaper::Reaper;

use crate::config::Config;
use crate::error::{Error, Result};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Accept loop that hands each connection to an isolated worker unit.
#[derive(Debug)]
pub struct Server {
    endpoint: ServerEndpoint,
    admission: AdmissionControl,
}

impl Server {
    pub fn bind(config: &Config) -> Result<Self> {
        let options = EndpointOptions {
            buffer_size: config.buffer_size,
            chunk_limit: config.chunk_limit,
            max_message: config.max_message,
            accept_poll: config.accept_poll,
            ..EndpointOptions::default()
        };
        let endpoint = ServerEndpoint::with_options(config.listen_addr(), config.handoff, options)?;
        let admission =
            AdmissionControl::new(config.mode, config.max_workers, config.poll_interval);

        Ok(Self {
            endpoint,
            admission,
        })
    }

    /// Route SIGTERM/SIGINT to the stop flag, and SIGCHLD to the reaper when
    /// workers are processes.
    pub fn install_signal_handlers(&mut self) -> Result<()> {
        let stop = self.endpoint.stop_flag();
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, stop)?;
        if self.admission.mode() == WorkerMode::Process {
            self.admission.register_reap_signal()?;
        }
        Ok(())
    }

    /// Flag that stops the loop when raised.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.endpoint.stop_flag()
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    /// Serve until stopped, running `handler` once per connection.
    ///
    /// On return every live worker has been drained and the listeners are
    /// closed. A forked child never returns from here.
    pub fn run<H>(&mut self, handler: H) -> Result<()>
    where
        H: Fn(&mut Session) -> Result<()> + Send + Sync + 'static,
    {
        info!(
            port = self.endpoint.port(),
            mode = %self.admission.mode(),
            max_workers = self.admission.max(),
            "accept loop started"
        );

        let handler = Arc::new(handler);
        let result = self.serve(&handler);
        self.shutdown();
        result
    }

    fn serve<H>(&mut self, handler: &Arc<H>) -> Result<()>
    where
        H: Fn(&mut Session) -> Result<()> + Send + Sync + 'static,
    {
        let stop = self.endpoint.stop_flag();

        while !self.endpoint.is_stopped() {
            match self.endpoint.accept() {
                Ok(Accepted::Handoff { port }) => {
                    debug!(port, "connection handed off");
                }
                Ok(Accepted::Terminate) | Ok(Accepted::Stopped) => break,
                Err(e @ (Error::Accept(_) | Error::NotMaster)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "handshake failed");
                    self.endpoint.release_connection();
                    continue;
                }
            }

            if !self.admission.admit(&stop) {
                self.endpoint.release_connection();
                break;
            }

            match self.admission.mode() {
                WorkerMode::Process => match self.endpoint.fork()? {
                    Fork::Child => self.run_child(handler.as_ref()),
                    Fork::Parent(pid) => self.admission.record_process(pid),
                },
                WorkerMode::Thread => {
                    let mut session = self.endpoint.detach();
                    let handler = Arc::clone(handler);
                    self.admission.spawn_thread(move || {
                        run_session(handler.as_ref(), &mut session);
                    })?;
                }
            }
        }
        Ok(())
    }

    fn run_child<H>(&mut self, handler: &H) -> !
    where
        H: Fn(&mut Session) -> Result<()>,
    {
        let mut session = self.endpoint.detach();
        self.endpoint.close();
        let code = if run_session(handler, &mut session) { 0 } else { 1 };
        std::process::exit(code)
    }

    fn shutdown(&mut self) {
        if self.endpoint.is_parent() {
            info!(live = self.admission.live(), "stopping, draining workers");
            self.admission.drain_all();
        }
        self.endpoint.close();
        info!("server stopped");
    }
}

/// Run one session to completion; `false` if the handler failed.
fn run_session<H>(handler: &H, session: &mut Session) -> bool
where
    H: Fn(&mut Session) -> Result<()> + ?Sized,
{
    let peer = session.peer();
    let ok = match handler(session) {
        Ok(()) => true,
        Err(e) if e.is_clean_disconnect() => true,
        Err(e) => {
            error!(peer = ?peer, error = %e, "worker failed");
            false
        }
    };
    session.close();
    debug!(peer = ?peer, "session finished");
    ok
}
