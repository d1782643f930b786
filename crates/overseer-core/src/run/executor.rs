//! Run orchestration
//!
//! The executor owns the life of one run: it creates the pending row,
//! derives a sandbox policy, spawns the agent process, registers it, and
//! hands the pipes to a detached worker. `execute` returns as soon as the
//! run is `running`; the worker owns stream consumption, exit wait, and the
//! terminal compare-and-set, so callers never block on completion.

use crate::error::{Error, ExecError, Result};
use crate::process::{drain_stderr, OutputStreamer, ProcessHandle, ProcessRegistry};
use crate::run::events::EventBus;
use crate::run::metrics::MetricsAggregator;
use crate::run::usage_limit::{MarkerDetector, UsageLimitDetector, UsageLimitMonitor};
use crate::sandbox::{PlatformPolicyProvider, PolicyProvider, SandboxPolicy};
use crate::storage::{self, Storage};
use crate::types::{Agent, Run, RunEvent, RunStatus};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// How long a graceful stop waits before escalating to a forced kill
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How many stderr lines a failure message carries
const STDERR_TAIL_IN_MESSAGE: usize = 10;

/// Orchestrates agent runs against storage, the process registry, and the
/// event sink
pub struct Executor {
    storage: Arc<Storage>,
    registry: Arc<ProcessRegistry>,
    events: Arc<EventBus>,
    policies: Arc<dyn PolicyProvider>,
    detector: Arc<dyn UsageLimitDetector>,
    grace: Duration,
}

impl Executor {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<ProcessRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            storage,
            registry,
            events,
            policies: Arc::new(PlatformPolicyProvider::new()),
            detector: Arc::new(MarkerDetector),
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_policy_provider(mut self, provider: Arc<dyn PolicyProvider>) -> Self {
        self.policies = provider;
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn UsageLimitDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Start a new run for an agent. Returns the run id once the process is
    /// live and the row is `running`; completion is observed through the
    /// event sink or by polling storage.
    pub async fn execute(&self, agent_id: &str, task: &str, project_path: &str) -> Result<String> {
        let agent = self.load_agent(agent_id)?;
        let run = Run::new(
            &agent.id,
            &agent.name,
            agent.icon.clone(),
            task,
            &agent.model,
            project_path,
        );
        // Nothing is spawned until the row exists.
        self.storage.with_retry(|conn| storage::insert_run(conn, &run))?;

        let run_id = run.id.clone();
        self.start_pending(run, &agent).await?;
        Ok(run_id)
    }

    /// Create a deferred run that the scheduler will start at `at`.
    pub fn schedule(
        &self,
        agent_id: &str,
        task: &str,
        project_path: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<String> {
        let agent = self.load_agent(agent_id)?;
        let run = Run::new(
            &agent.id,
            &agent.name,
            agent.icon.clone(),
            task,
            &agent.model,
            project_path,
        )
        .scheduled(at);
        self.storage.with_retry(|conn| storage::insert_run(conn, &run))?;

        info!("Scheduled run {} for {}", run.id, at.to_rfc3339());
        Ok(run.id)
    }

    /// Cancel a running run. Idempotent success for runs that are already
    /// terminal; any other non-running status is rejected.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let run = self.get_run(run_id)?;
        if run.status.is_terminal() {
            return Ok(());
        }
        if run.status != RunStatus::Running {
            return Err(Error::Exec(ExecError::InvalidStateTransition {
                run_id: run_id.to_string(),
                expected: "running".to_string(),
                actual: run.status.as_str().to_string(),
            }));
        }

        info!("Cancelling run {}", run_id);
        self.registry.stop(run_id, self.grace).await?;

        // The worker usually records the transition when it observes the
        // cancellation flag; whoever wins the compare-and-set publishes.
        let won = self
            .storage
            .with_retry(|conn| storage::mark_cancelled(conn, run_id))?;
        if won {
            self.publish_lifecycle(run_id, RunStatus::Cancelled, None, true);
        }
        Ok(())
    }

    /// Continue a paused run as a new row. The paused parent is left
    /// untouched; the child records its lineage and starts immediately.
    pub async fn resume(&self, run_id: &str) -> Result<String> {
        let parent = self.get_run(run_id)?;
        if parent.status != RunStatus::PausedUsageLimit {
            return Err(Error::Exec(ExecError::InvalidStateTransition {
                run_id: run_id.to_string(),
                expected: "paused_usage_limit".to_string(),
                actual: parent.status.as_str().to_string(),
            }));
        }

        let agent = self.load_agent(&parent.agent_id)?;
        let child = Run::resuming(&parent);
        self.storage
            .with_retry(|conn| storage::insert_run(conn, &child))?;

        let child_id = child.id.clone();
        info!(
            "Resuming run {} as {} (resume #{})",
            parent.id, child_id, child.resume_count
        );
        self.start_pending(child, &agent).await?;
        Ok(child_id)
    }

    /// Runs, optionally filtered by status
    pub fn list(&self, filter: Option<RunStatus>) -> Result<Vec<Run>> {
        let conn = self.storage.connection()?;
        match filter {
            Some(status) => storage::runs_by_status(&conn, status),
            None => storage::list_runs(&conn, 100, 0),
        }
    }

    /// Toggle automatic resumption for a non-terminal run.
    pub fn set_auto_resume(&self, run_id: &str, enabled: bool) -> Result<()> {
        let run = self.get_run(run_id)?;
        if run.status.is_terminal() {
            return Err(Error::Exec(ExecError::InvalidStateTransition {
                run_id: run_id.to_string(),
                expected: "an active status".to_string(),
                actual: run.status.as_str().to_string(),
            }));
        }
        self.storage
            .with_retry(|conn| storage::set_auto_resume(conn, run_id, enabled))
    }

    /// Subscribe to one run's event stream.
    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe(run_id)
    }

    /// Start a row the scheduler has already claimed into `pending`.
    pub(crate) async fn start_claimed(&self, run_id: &str) -> Result<()> {
        let run = self.get_run(run_id)?;
        if run.status != RunStatus::Pending {
            return Err(Error::Exec(ExecError::InvalidStateTransition {
                run_id: run_id.to_string(),
                expected: "pending".to_string(),
                actual: run.status.as_str().to_string(),
            }));
        }
        let agent = match self.load_agent(&run.agent_id) {
            Ok(agent) => agent,
            Err(e) => {
                // The agent vanished between scheduling and firing; the
                // claimed row would otherwise sit pending forever.
                let msg = format!("agent unavailable: {}", e);
                self.storage.with_retry(|conn| {
                    storage::mark_failed(conn, &run.id, RunStatus::Pending, &msg)
                })?;
                self.publish_lifecycle(&run.id, RunStatus::Failed, Some(msg), true);
                return Err(e);
            }
        };
        self.start_pending(run, &agent).await
    }

    fn load_agent(&self, agent_id: &str) -> Result<Agent> {
        let conn = self.storage.connection()?;
        let agent = storage::get_agent(&conn, agent_id)?
            .ok_or_else(|| Error::Exec(ExecError::AgentNotFound(agent_id.to_string())))?;
        if !agent.enabled {
            return Err(Error::Exec(ExecError::AgentDisabled(agent_id.to_string())));
        }
        Ok(agent)
    }

    fn get_run(&self, run_id: &str) -> Result<Run> {
        let conn = self.storage.connection()?;
        storage::get_run(&conn, run_id)?
            .ok_or_else(|| Error::Exec(ExecError::RunNotFound(run_id.to_string())))
    }

    fn publish_lifecycle(
        &self,
        run_id: &str,
        status: RunStatus,
        message: Option<String>,
        close: bool,
    ) {
        self.events.emit(RunEvent::Lifecycle {
            run_id: run_id.to_string(),
            status,
            message,
        });
        if close {
            self.events.close(run_id);
        }
    }

    /// Spawn the process for a pending row, register it, flip the row to
    /// `running`, and detach the streaming worker.
    async fn start_pending(&self, run: Run, agent: &Agent) -> Result<()> {
        let policy = match self.policies.derive_policy(agent) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(
                    "No sandbox policy for agent {}: {}; running without sandboxing",
                    agent.id, e
                );
                SandboxPolicy::permissive()
            }
        };

        // A resumed run hands the parent's provider session to the child so
        // the conversation continues instead of starting over.
        let resume_session = match &run.parent_run_id {
            Some(parent_id) => {
                let conn = self.storage.connection()?;
                storage::get_run(&conn, parent_id)?.and_then(|p| p.session_id)
            }
            None => None,
        };

        let mut cmd = build_command(agent, &run, &policy, resume_session.as_deref());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("failed to spawn {}: {}", agent.command, e);
                self.storage.with_retry(|conn| {
                    storage::mark_failed(conn, &run.id, RunStatus::Pending, &msg)
                })?;
                self.publish_lifecycle(&run.id, RunStatus::Failed, Some(msg.clone()), true);
                return Err(Error::Exec(ExecError::Spawn(msg)));
            }
        };

        let Some(pid) = child.id() else {
            let msg = "process exited before a pid was assigned".to_string();
            let _ = child.start_kill();
            self.storage.with_retry(|conn| {
                storage::mark_failed(conn, &run.id, RunStatus::Pending, &msg)
            })?;
            self.publish_lifecycle(&run.id, RunStatus::Failed, Some(msg.clone()), true);
            return Err(Error::Exec(ExecError::Spawn(msg)));
        };

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let msg = "failed to capture process output".to_string();
                let _ = child.start_kill();
                self.storage.with_retry(|conn| {
                    storage::mark_failed(conn, &run.id, RunStatus::Pending, &msg)
                })?;
                self.publish_lifecycle(&run.id, RunStatus::Failed, Some(msg.clone()), true);
                return Err(Error::Exec(ExecError::Spawn(msg)));
            }
        };

        let handle = ProcessHandle::new(pid, child);
        let cancel_flag = Arc::clone(&handle.cancel_requested);
        if let Err(e) = self.registry.register(&run.id, handle) {
            // Dropping the rejected handle kills the child (kill_on_drop).
            let msg = "another live process is already registered for this run".to_string();
            self.storage.with_retry(|conn| {
                storage::mark_failed(conn, &run.id, RunStatus::Pending, &msg)
            })?;
            self.publish_lifecycle(&run.id, RunStatus::Failed, Some(msg), true);
            return Err(e);
        }

        let won = match self
            .storage
            .with_retry(|conn| storage::mark_running(conn, &run.id, pid, chrono::Utc::now()))
        {
            Ok(won) => won,
            Err(e) => {
                error!("Failed to persist running transition for {}: {}", run.id, e);
                self.kill_registered(&run.id).await;
                return Err(e);
            }
        };
        if !won {
            self.kill_registered(&run.id).await;
            return Err(Error::Internal(format!(
                "run {} left pending state before it could start",
                run.id
            )));
        }

        self.publish_lifecycle(&run.id, RunStatus::Running, None, false);
        info!("Run {} started (agent {}, pid {})", run.id, agent.id, pid);

        let worker = RunWorker {
            storage: Arc::clone(&self.storage),
            registry: Arc::clone(&self.registry),
            events: Arc::clone(&self.events),
            monitor: UsageLimitMonitor::new(Arc::clone(&self.detector)),
            grace: self.grace,
            run_id: run.id.clone(),
            model: run.model.clone(),
            cancel_flag,
        };
        tokio::spawn(worker.run(stdout, stderr));
        Ok(())
    }

    async fn kill_registered(&self, run_id: &str) {
        if let Some(mut handle) = self.registry.take(run_id) {
            let _ = handle.child.start_kill();
            let _ = handle.child.wait().await;
        }
    }
}

fn build_command(
    agent: &Agent,
    run: &Run,
    policy: &SandboxPolicy,
    resume_session: Option<&str>,
) -> Command {
    debug!(
        "Building command for run {}: {} {:?} (cwd: {})",
        run.id, agent.command, agent.args, run.project_path
    );

    let mut cmd = Command::new(&agent.command);
    cmd.args(&agent.args)
        .arg(&run.task)
        .envs(&agent.env)
        .env("OVERSEER_RUN_ID", &run.id)
        .env("OVERSEER_MODEL", &run.model)
        .current_dir(&run.project_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in policy.env_vars() {
        cmd.env(key, value);
    }
    if let Some(session) = resume_session {
        cmd.env("OVERSEER_RESUME_SESSION", session);
    }
    cmd
}

/// Detached per-run worker: drains the pipes, waits for exit, and records
/// the final transition. Finalization priority is usage-limit pause, then
/// user cancellation, then the natural exit status; the compare-and-set
/// helpers make whichever transition lands first stick.
struct RunWorker {
    storage: Arc<Storage>,
    registry: Arc<ProcessRegistry>,
    events: Arc<EventBus>,
    monitor: UsageLimitMonitor,
    grace: Duration,
    run_id: String,
    model: String,
    cancel_flag: Arc<AtomicBool>,
}

impl RunWorker {
    async fn run(self, stdout: ChildStdout, stderr: ChildStderr) {
        let metrics = MetricsAggregator::new(&self.model);
        let streamer = OutputStreamer::new();
        let stderr_tail: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let limit_slot = Mutex::new(None);

        let stderr_task = tokio::spawn(drain_stderr(stderr, Arc::clone(&stderr_tail)));

        let mut session_recorded = false;
        streamer
            .consume(stdout, |msg| {
                if !session_recorded {
                    if let Some(session_id) = &msg.session_id {
                        session_recorded = true;
                        if let Err(e) = self.storage.with_retry(|conn| {
                            storage::set_session_id(conn, &self.run_id, session_id)
                        }) {
                            warn!("Failed to record session id for {}: {}", self.run_id, e);
                        }
                    }
                }

                metrics.record(&msg);
                let has_usage = msg.usage.is_some();
                self.events.emit(RunEvent::Output {
                    run_id: self.run_id.clone(),
                    message: msg.clone(),
                });
                if has_usage {
                    self.emit_metrics(&metrics, &streamer);
                }

                if let Some(signal) = self.monitor.inspect(&msg) {
                    info!(
                        "Usage limit hit on run {}; pausing until {}",
                        self.run_id,
                        signal.reset_time.to_rfc3339()
                    );
                    *limit_slot.lock() = Some(signal);
                    // Stop the process; the stream keeps draining until the
                    // pipe closes.
                    let registry = Arc::clone(&self.registry);
                    let run_id = self.run_id.clone();
                    let grace = self.grace;
                    tokio::spawn(async move {
                        if let Err(e) = registry.stop(&run_id, grace).await {
                            warn!("Failed to stop paused run {}: {}", run_id, e);
                        }
                    });
                }
            })
            .await;

        let _ = stderr_task.await;

        // The entry is still ours unless a stop escalation already reaped
        // the process.
        let exit = match self.registry.take(&self.run_id) {
            Some(mut handle) => handle.child.wait().await.ok(),
            None => None,
        };

        self.emit_metrics(&metrics, &streamer);

        let limit = limit_slot.lock().take();
        if let Some(signal) = limit {
            // Pause outranks a concurrent natural exit.
            let message = format!(
                "usage limit reached; paused until {}",
                signal.reset_time.to_rfc3339()
            );
            self.finish(
                |conn| storage::mark_paused(conn, &self.run_id, signal.reset_time),
                RunStatus::PausedUsageLimit,
                Some(message),
            );
        } else if self.cancel_flag.load(Ordering::SeqCst) {
            self.finish(
                |conn| storage::mark_cancelled(conn, &self.run_id),
                RunStatus::Cancelled,
                None,
            );
        } else {
            match exit {
                Some(status) if status.success() => {
                    self.finish(
                        |conn| storage::mark_completed(conn, &self.run_id),
                        RunStatus::Completed,
                        None,
                    );
                }
                Some(status) => {
                    let message = self.failure_message(status.code(), &stderr_tail);
                    self.finish(
                        |conn| {
                            storage::mark_failed(conn, &self.run_id, RunStatus::Running, &message)
                        },
                        RunStatus::Failed,
                        Some(message.clone()),
                    );
                }
                None => {
                    let message = "process terminated without an exit status".to_string();
                    self.finish(
                        |conn| {
                            storage::mark_failed(conn, &self.run_id, RunStatus::Running, &message)
                        },
                        RunStatus::Failed,
                        Some(message.clone()),
                    );
                }
            }
        }
    }

    fn emit_metrics(&self, metrics: &MetricsAggregator, streamer: &OutputStreamer) {
        let mut snapshot = metrics.snapshot();
        snapshot.parse_warnings = streamer.warning_count();
        self.events.emit(RunEvent::Metrics {
            run_id: self.run_id.clone(),
            snapshot,
        });
    }

    fn failure_message(
        &self,
        code: Option<i32>,
        stderr_tail: &Arc<Mutex<VecDeque<String>>>,
    ) -> String {
        let mut message = match code {
            Some(code) => format!("process exited with code {}", code),
            None => "process terminated by signal".to_string(),
        };
        let tail = stderr_tail.lock();
        if !tail.is_empty() {
            let skip = tail.len().saturating_sub(STDERR_TAIL_IN_MESSAGE);
            let lines: Vec<&str> = tail.iter().skip(skip).map(String::as_str).collect();
            message.push_str("; stderr tail:\n");
            message.push_str(&lines.join("\n"));
        }
        message
    }

    /// Apply a terminal (or pause) compare-and-set and publish the outcome.
    /// Losing the race means another component finalized first; their event
    /// already told the story.
    fn finish(
        &self,
        transition: impl FnMut(&rusqlite::Connection) -> Result<bool>,
        status: RunStatus,
        message: Option<String>,
    ) {
        match self.storage.with_retry(transition) {
            Ok(true) => {
                self.events.emit(RunEvent::Lifecycle {
                    run_id: self.run_id.clone(),
                    status,
                    message,
                });
                self.events.close(&self.run_id);
            }
            Ok(false) => {
                debug!(
                    "Run {} already finalized elsewhere; {} transition skipped",
                    self.run_id,
                    status.as_str()
                );
            }
            Err(e) => {
                error!(
                    "Failed to record {} for run {}: {}",
                    status.as_str(),
                    self.run_id,
                    e
                );
            }
        }
    }
}
