//! In-memory authority on which runs currently have a live OS process

use crate::error::{Error, ExecError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

/// A registered live process. Stdout/stderr are detached before
/// registration; the child stays here so control operations can reach it
/// while the streaming worker drains the pipes.
pub struct ProcessHandle {
    pub pid: u32,
    pub child: Child,
    /// Set when a user cancellation has been requested for this run. The
    /// streaming worker holds a clone and consults it when the process
    /// exits.
    pub cancel_requested: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn new(pid: u32, child: Child) -> Self {
        Self {
            pid,
            child,
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Concurrency-safe map from run id to live process handle. All mutating
/// operations take the single lock, so two concurrent registrations for the
/// same id cannot both succeed.
#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<HashMap<String, ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live process for a run. Fails with `AlreadyRunning` if an
    /// entry for the id already exists.
    pub fn register(&self, run_id: &str, handle: ProcessHandle) -> Result<()> {
        let mut map = self.inner.lock();
        if map.contains_key(run_id) {
            return Err(Error::Exec(ExecError::AlreadyRunning(run_id.to_string())));
        }
        debug!("Registered process {} for run {}", handle.pid, run_id);
        map.insert(run_id.to_string(), handle);
        Ok(())
    }

    /// Atomically remove and return the handle for exclusive use.
    pub fn take(&self, run_id: &str) -> Option<ProcessHandle> {
        self.inner.lock().remove(run_id)
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.inner.lock().contains_key(run_id)
    }

    pub fn pid_of(&self, run_id: &str) -> Option<u32> {
        self.inner.lock().get(run_id).map(|h| h.pid)
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Signal graceful termination and wait up to `grace` for the process
    /// to go away (the streaming worker removes the entry when the process
    /// exits). If it is still alive after the grace period, escalate to
    /// forced termination. Returns false when no entry existed.
    pub async fn stop(&self, run_id: &str, grace: Duration) -> Result<bool> {
        let pid = {
            let map = self.inner.lock();
            match map.get(run_id) {
                Some(handle) => {
                    handle.cancel_requested.store(true, Ordering::SeqCst);
                    handle.pid
                }
                None => return Ok(false),
            }
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                warn!("Failed to send SIGINT to {}: {}", pid, e);
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.is_running(run_id) {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Some(mut handle) = self.take(run_id) {
            warn!(
                "Process {} for run {} ignored graceful stop, killing",
                pid, run_id
            );
            if let Err(e) = handle.child.start_kill() {
                warn!("Failed to kill {}: {}", pid, e);
            }
            let _ = handle.child.wait().await;
        }
        Ok(true)
    }
}
