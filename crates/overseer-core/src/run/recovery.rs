//! Startup reconciliation of storage against process reality
//!
//! No process survives a restart of the host, so a `running` row found at
//! startup describes a process that no longer exists. Run this before the
//! scheduler starts and before any new execution is accepted.

use crate::error::Result;
use crate::process::ProcessRegistry;
use crate::storage::{self, Storage};
use crate::types::RunStatus;
use tracing::{info, warn};

/// Reason recorded on runs orphaned by a restart
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

/// Mark every `running` row without a live process as failed. Paused rows
/// hold no process and are left untouched. Returns how many rows were
/// repaired.
pub fn recover(storage: &Storage, registry: &ProcessRegistry) -> Result<usize> {
    let stale = {
        let conn = storage.connection()?;
        storage::runs_by_status(&conn, RunStatus::Running)?
    };

    let mut repaired = 0;
    for run in stale {
        if registry.is_running(&run.id) {
            continue;
        }
        let won = storage.with_retry(|conn| {
            storage::mark_failed(conn, &run.id, RunStatus::Running, INTERRUPTED_REASON)
        })?;
        if won {
            warn!(
                "Run {} (pid {:?}) was running at shutdown; marked failed",
                run.id, run.pid
            );
            repaired += 1;
        }
    }

    if repaired > 0 {
        info!("Crash recovery repaired {} run(s)", repaired);
    }
    Ok(repaired)
}
