//! Run rows and the run status state machine

use crate::error::{Error, Result, StorageError};
use serde::{Deserialize, Serialize};

/// Run status state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Row created, process not yet spawned
    Pending,
    /// Deferred until `scheduled_start_time`
    Scheduled,
    /// Live process attached
    Running,
    /// Process exited with code zero
    Completed,
    /// Spawn failure, non-zero exit, or interrupted by restart
    Failed,
    /// Terminated by user request
    Cancelled,
    /// Provider signalled a usage limit; waiting for the reset time
    PausedUsageLimit,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Holds or will hold a process.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Persisted string form. Total with `parse`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::PausedUsageLimit => "paused_usage_limit",
        }
    }

    /// Parse the persisted string form. Unknown strings are rejected at the
    /// storage boundary rather than mapped to a default.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "paused_usage_limit" => Ok(Self::PausedUsageLimit),
            other => Err(Error::Storage(StorageError::UnknownStatus(
                other.to_string(),
            ))),
        }
    }
}

/// One execution attempt of an agent, persisted with status and lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub agent_id: String,
    /// Denormalized for display without an agent lookup
    pub agent_name: String,
    pub agent_icon: Option<String>,
    pub task: String,
    pub model: String,
    pub project_path: String,
    /// The child process's own session identifier, harvested from its
    /// init message once streaming starts
    pub session_id: Option<String>,
    pub status: RunStatus,
    /// Set iff status == Running
    pub pid: Option<u32>,
    pub process_started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub scheduled_start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Set only on a terminal status
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Set only while status == PausedUsageLimit
    pub usage_limit_reset_time: Option<chrono::DateTime<chrono::Utc>>,
    pub auto_resume_enabled: bool,
    pub resume_count: u32,
    /// Forward-only chain to the run this one continues
    pub parent_run_id: Option<String>,
    pub error_message: Option<String>,
}

impl Run {
    /// New pending run for an agent.
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        agent_icon: Option<String>,
        task: impl Into<String>,
        model: impl Into<String>,
        project_path: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            agent_icon,
            task: task.into(),
            model: model.into(),
            project_path: project_path.into(),
            session_id: None,
            status: RunStatus::Pending,
            pid: None,
            process_started_at: None,
            scheduled_start_time: None,
            created_at: chrono::Utc::now(),
            completed_at: None,
            usage_limit_reset_time: None,
            auto_resume_enabled: false,
            resume_count: 0,
            parent_run_id: None,
            error_message: None,
        }
    }

    /// New scheduled run, deferred until `at`.
    pub fn scheduled(mut self, at: chrono::DateTime<chrono::Utc>) -> Self {
        self.status = RunStatus::Scheduled;
        self.scheduled_start_time = Some(at);
        self
    }

    /// New pending run continuing a paused parent. Copies the execution
    /// parameters and advances the lineage counters; the parent row itself
    /// is left untouched.
    pub fn resuming(parent: &Run) -> Self {
        let mut run = Self::new(
            parent.agent_id.clone(),
            parent.agent_name.clone(),
            parent.agent_icon.clone(),
            parent.task.clone(),
            parent.model.clone(),
            parent.project_path.clone(),
        );
        run.parent_run_id = Some(parent.id.clone());
        run.resume_count = parent.resume_count + 1;
        run.auto_resume_enabled = parent.auto_resume_enabled;
        run
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
