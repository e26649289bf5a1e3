//! Child-process reaping for the process-per-connection mode.
//!
//! The SIGCHLD handler only raises a flag. The accept loop then drains every
//! exited child with `waitpid(WNOHANG)` and turns each one into a completion
//! notice, so the live-worker counter is only ever touched by that loop.

use super::admission::WorkerExit;
use crate::error::Result;
use crossbeam_channel::Sender;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default)]
pub struct Reaper {
    pending: Arc<AtomicBool>,
    /// Set once SIGCHLD is hooked; until then every reap polls.
    armed: bool,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the pending flag from SIGCHLD.
    pub fn register(&mut self) -> Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGCHLD, Arc::clone(&self.pending))?;
        self.armed = true;
        Ok(())
    }

    /// Reap every child that has exited so far, sending one notice each.
    pub fn reap(&self, notices: &Sender<WorkerExit>) -> usize {
        if self.armed && !self.pending.swap(false, Ordering::AcqRel) {
            return 0;
        }

        let mut reaped = 0;
        loop {
            let mut status = 0;
            // SAFETY: waitpid only writes the status integer we own.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            trace!(pid, status, "reaped child");
            let _ = notices.send(WorkerExit::Process { pid, status });
            reaped += 1;
        }
        reaped
    }
}

/// Block until every child of this process has exited.
pub fn wait_all() -> usize {
    let mut reaped = 0;
    loop {
        // SAFETY: a null status pointer is allowed.
        let pid = unsafe { libc::waitpid(-1, std::ptr::null_mut(), 0) };
        if pid > 0 {
            reaped += 1;
            continue;
        }
        if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        break;
    }
    reaped
}
