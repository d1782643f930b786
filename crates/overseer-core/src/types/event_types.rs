//! Events published on the per-run sink

use super::{MetricsSnapshot, RunStatus, StreamMessage};
use serde::{Deserialize, Serialize};

/// Event emitted for a single run, scoped to that run's subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// Status transition written to storage
    Lifecycle {
        run_id: String,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// One parsed output record, in the subprocess's own write order
    Output {
        run_id: String,
        message: StreamMessage,
    },
    /// Point-in-time metrics totals
    Metrics {
        run_id: String,
        snapshot: MetricsSnapshot,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Lifecycle { run_id, .. } => run_id,
            Self::Output { run_id, .. } => run_id,
            Self::Metrics { run_id, .. } => run_id,
        }
    }
}
