//! Admission control: bound the number of live worker units.
//!
//! The accept loop owns the counter. Workers never touch it; they (or the
//! reaper, for child processes) post a [`WorkerExit`] on a channel that the
//! loop drains before each admission decision.

use super::reaper::{self, Reaper};
use crate::error::Result;
use crossbeam_channel::{Receiver, Sender};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How each accepted connection is isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Fork one child process per connection.
    #[default]
    Process,
    /// Spawn one thread per connection.
    Thread,
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerMode::Process => write!(f, "process"),
            WorkerMode::Thread => write!(f, "thread"),
        }
    }
}

/// Completion notice for one worker unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Process { pid: libc::pid_t, status: i32 },
    Thread { id: u64 },
}

/// Sends the thread's exit notice when the worker returns or unwinds.
struct ExitNotice {
    id: u64,
    notices: Sender<WorkerExit>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.notices.send(WorkerExit::Thread { id: self.id });
    }
}

#[derive(Debug)]
pub struct AdmissionControl {
    mode: WorkerMode,
    max: usize,
    live: usize,
    poll_interval: Duration,
    exits_tx: Sender<WorkerExit>,
    exits_rx: Receiver<WorkerExit>,
    threads: HashMap<u64, JoinHandle<()>>,
    next_id: u64,
    reaper: Reaper,
    resets: usize,
}

impl AdmissionControl {
    pub fn new(mode: WorkerMode, max: usize, poll_interval: Duration) -> Self {
        let (exits_tx, exits_rx) = crossbeam_channel::unbounded();
        Self {
            mode,
            max: max.max(1),
            live: 0,
            poll_interval,
            exits_tx,
            exits_rx,
            threads: HashMap::new(),
            next_id: 0,
            reaper: Reaper::new(),
            resets: 0,
        }
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Live worker count as of the last [`collect`](Self::collect).
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of drain-and-reset recoveries so far.
    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Sender for completion notices.
    pub fn notifier(&self) -> Sender<WorkerExit> {
        self.exits_tx.clone()
    }

    /// Let SIGCHLD gate the reaper instead of polling `waitpid` every time.
    pub fn register_reap_signal(&mut self) -> Result<()> {
        self.reaper.register()
    }

    /// Apply every completion notice received so far; returns how many.
    pub fn collect(&mut self) -> usize {
        if self.mode == WorkerMode::Process {
            self.reaper.reap(&self.exits_tx);
        }

        let mut applied = 0;
        while let Ok(exit) = self.exits_rx.try_recv() {
            match exit {
                WorkerExit::Process { pid, status } => {
                    debug!(pid, status, "worker process exited");
                }
                WorkerExit::Thread { id } => {
                    if let Some(handle) = self.threads.remove(&id) {
                        if handle.join().is_err() {
                            error!(worker = id, "worker thread panicked");
                        }
                    }
                    debug!(worker = id, "worker thread exited");
                }
            }

            match self.live.checked_sub(1) {
                Some(live) => self.live = live,
                None => {
                    self.counter_error("underflow");
                    return applied;
                }
            }
            applied += 1;
        }
        applied
    }

    /// Take a slot if one is free.
    pub fn try_admit(&mut self) -> bool {
        self.collect();
        self.live < self.max
    }

    /// Wait for a free slot, sleeping `poll_interval` between checks.
    ///
    /// Returns `false` if `stop` is raised first.
    pub fn admit(&mut self, stop: &AtomicBool) -> bool {
        let mut logged = false;
        loop {
            if self.try_admit() {
                return true;
            }
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            if !logged {
                info!(live = self.live, max = self.max, "at worker capacity, waiting");
                logged = true;
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Count a forked child.
    pub fn record_process(&mut self, pid: libc::pid_t) {
        debug!(pid, "worker process started");
        self.record_spawn();
    }

    /// Run `work` on a new named thread and count it.
    pub fn spawn_thread<F>(&mut self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;

        let notice = ExitNotice {
            id,
            notices: self.exits_tx.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                let _notice = notice;
                work();
            })?;

        self.threads.insert(id, handle);
        debug!(worker = id, "worker thread started");
        self.record_spawn();
        Ok(())
    }

    fn record_spawn(&mut self) {
        self.live += 1;
        if self.live > self.max {
            self.counter_error("overflow");
        }
    }

    fn counter_error(&mut self, kind: &str) {
        warn!(kind, live = self.live, max = self.max, "worker counter out of range, resetting");
        self.reset();
    }

    /// Drain every outstanding worker and zero the counter.
    pub fn reset(&mut self) {
        self.drain_all();
        self.resets += 1;
    }

    /// Block until every worker unit has exited.
    pub fn drain_all(&mut self) {
        let reaped = match self.mode {
            WorkerMode::Process => reaper::wait_all(),
            WorkerMode::Thread => {
                let handles: Vec<_> = self.threads.drain().collect();
                let joined = handles.len();
                for (id, handle) in handles {
                    if handle.join().is_err() {
                        error!(worker = id, "worker thread panicked");
                    }
                }
                joined
            }
        };
        while self.exits_rx.try_recv().is_ok() {}
        if reaped > 0 {
            info!(reaped, "drained workers");
        }
        self.live = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn process_control(max: usize) -> AdmissionControl {
        AdmissionControl::new(WorkerMode::Process, max, Duration::from_millis(1))
    }

    #[test]
    fn test_capacity_bound() {
        let mut admission = process_control(2);
        assert!(admission.try_admit());
        admission.record_process(1_000_001);
        assert!(admission.try_admit());
        admission.record_process(1_000_002);
        assert_eq!(admission.live(), 2);
        assert!(!admission.try_admit());

        admission
            .notifier()
            .send(WorkerExit::Process {
                pid: 1_000_001,
                status: 0,
            })
            .unwrap();
        assert!(admission.try_admit());
        assert_eq!(admission.live(), 1);
        assert_eq!(admission.resets(), 0);
    }

    #[test]
    fn test_underflow_resets() {
        let mut admission = process_control(3);
        admission
            .notifier()
            .send(WorkerExit::Process { pid: 42, status: 0 })
            .unwrap();
        admission.collect();
        assert_eq!(admission.live(), 0);
        assert_eq!(admission.resets(), 1);
    }

    #[test]
    fn test_overflow_resets() {
        let mut admission = process_control(1);
        admission.record_process(1_000_001);
        admission.record_process(1_000_002);
        assert_eq!(admission.live(), 0);
        assert_eq!(admission.resets(), 1);
    }

    #[test]
    fn test_admit_gives_up_when_stopped() {
        let mut admission = process_control(1);
        admission.record_process(1_000_001);
        let stop = AtomicBool::new(true);
        assert!(!admission.admit(&stop));
    }

    #[test]
    fn test_thread_workers_release_slots() {
        let mut admission =
            AdmissionControl::new(WorkerMode::Thread, 2, Duration::from_millis(1));
        let (release_tx, release_rx) = mpsc::channel::<()>();

        admission
            .spawn_thread(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        admission.spawn_thread(|| {}).unwrap();
        assert_eq!(admission.live(), 2);

        // The short-lived worker frees its slot without help.
        let stop = AtomicBool::new(false);
        assert!(admission.admit(&stop));
        assert_eq!(admission.live(), 1);

        release_tx.send(()).unwrap();
        admission.drain_all();
        assert_eq!(admission.live(), 0);
        assert_eq!(admission.resets(), 0);
    }

    #[test]
    fn test_panicking_thread_still_exits() {
        let mut admission =
            AdmissionControl::new(WorkerMode::Thread, 1, Duration::from_millis(1));
        admission.spawn_thread(|| panic!("worker failed")).unwrap();

        let stop = AtomicBool::new(false);
        assert!(admission.admit(&stop));
        assert_eq!(admission.live(), 0);
    }

    #[test]
    fn test_mode_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: WorkerMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"thread\"").unwrap();
        assert_eq!(parsed.mode, WorkerMode::Thread);
        assert_eq!(WorkerMode::default().to_string(), "process");
    }
}
