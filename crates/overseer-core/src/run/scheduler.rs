//! Background loop firing due scheduled and auto-resumable runs
//!
//! Each poll claims a row with a compare-and-set before firing it, so a run
//! is never started twice even when a due row survives across several
//! ticks or multiple pollers race.

use crate::error::Result;
use crate::run::executor::Executor;
use crate::storage::{self, Storage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Default poll interval
pub const DEFAULT_TICK: Duration = Duration::from_secs(30);

pub struct Scheduler {
    storage: Arc<Storage>,
    executor: Arc<Executor>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(storage: Arc<Storage>, executor: Arc<Executor>) -> Self {
        Self {
            storage,
            executor,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Poll until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started (tick {:?})", self.tick);
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("Scheduler poll failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Scheduler stopping");
                    break;
                }
            }
        }
    }

    /// One pass over the due work. Claim-then-fire: the row's status (or
    /// auto-resume flag) is flipped before the execution starts, so a
    /// second poll can no longer see it.
    pub async fn poll_once(&self) -> Result<()> {
        let now = chrono::Utc::now();

        let due = {
            let conn = self.storage.connection()?;
            storage::due_scheduled(&conn, now)?
        };
        for run in due {
            let claimed = self
                .storage
                .with_retry(|conn| storage::claim_scheduled(conn, &run.id))?;
            if !claimed {
                continue;
            }
            info!("Starting scheduled run {}", run.id);
            if let Err(e) = self.executor.start_claimed(&run.id).await {
                error!("Scheduled run {} failed to start: {}", run.id, e);
            }
        }

        let due = {
            let conn = self.storage.connection()?;
            storage::due_auto_resume(&conn, now)?
        };
        for run in due {
            let claimed = self
                .storage
                .with_retry(|conn| storage::claim_auto_resume(conn, &run.id))?;
            if !claimed {
                continue;
            }
            match self.executor.resume(&run.id).await {
                Ok(child_id) => info!("Auto-resumed run {} as {}", run.id, child_id),
                Err(e) => error!("Auto-resume of run {} failed: {}", run.id, e),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessRegistry;
    use crate::run::events::EventBus;
    use crate::types::{Agent, Run, RunStatus};

    struct Harness {
        _dir: tempfile::TempDir,
        storage: Arc<Storage>,
        scheduler: Scheduler,
        executor: Arc<Executor>,
        project: String,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new_with_path(dir.path().join("db")).unwrap());
        let executor = Arc::new(
            Executor::new(
                Arc::clone(&storage),
                Arc::new(ProcessRegistry::new()),
                Arc::new(EventBus::new()),
            )
            .with_grace_period(Duration::from_millis(500)),
        );
        let scheduler = Scheduler::new(Arc::clone(&storage), Arc::clone(&executor))
            .with_tick(Duration::from_millis(50));
        let project = dir.path().to_str().unwrap().to_string();

        let agent = Agent::new("shell", "Shell", "sh").with_args(vec!["-c".to_string()]);
        let conn = storage.connection().unwrap();
        storage::upsert_agent(&conn, &agent).unwrap();
        drop(conn);

        Harness {
            _dir: dir,
            storage,
            scheduler,
            executor,
            project,
        }
    }

    async fn wait_for_status(storage: &Storage, run_id: &str, status: RunStatus) -> Run {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let run = {
                let conn = storage.connection().unwrap();
                storage::get_run(&conn, run_id).unwrap().unwrap()
            };
            if run.status == status {
                return run;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run {} stuck in {:?}",
                run_id,
                run.status
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_due_scheduled_run_fires_exactly_once() {
        let h = harness();
        let run_id = h
            .executor
            .schedule(
                "shell",
                "echo '{\"type\":\"result\"}'",
                &h.project,
                chrono::Utc::now() - chrono::Duration::minutes(1),
            )
            .unwrap();

        // Poll twice; the claim makes the second pass a no-op.
        h.scheduler.poll_once().await.unwrap();
        h.scheduler.poll_once().await.unwrap();

        wait_for_status(&h.storage, &run_id, RunStatus::Completed).await;
        assert_eq!(h.executor.list(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_future_scheduled_run_not_fired() {
        let h = harness();
        let run_id = h
            .executor
            .schedule(
                "shell",
                "echo hi",
                &h.project,
                chrono::Utc::now() + chrono::Duration::hours(1),
            )
            .unwrap();

        h.scheduler.poll_once().await.unwrap();

        let conn = h.storage.connection().unwrap();
        let run = storage::get_run(&conn, &run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_auto_resume_fires_exactly_once() {
        let h = harness();

        // Paused parent whose reset time has passed.
        let mut parent = Run::new(
            "shell",
            "Shell",
            None,
            "echo '{\"type\":\"result\"}'",
            "sonnet",
            &h.project,
        );
        parent.auto_resume_enabled = true;
        {
            let conn = h.storage.connection().unwrap();
            storage::insert_run(&conn, &parent).unwrap();
            storage::mark_running(&conn, &parent.id, 1, chrono::Utc::now()).unwrap();
            storage::mark_paused(
                &conn,
                &parent.id,
                chrono::Utc::now() - chrono::Duration::seconds(5),
            )
            .unwrap();
        }

        h.scheduler.poll_once().await.unwrap();
        h.scheduler.poll_once().await.unwrap();

        let conn = h.storage.connection().unwrap();
        let children = storage::children_of(&conn, &parent.id).unwrap();
        assert_eq!(children.len(), 1);
        drop(conn);
        wait_for_status(&h.storage, &children[0].id, RunStatus::Completed).await;

        // The parent keeps its paused status; only the flag was consumed.
        let conn = h.storage.connection().unwrap();
        let parent = storage::get_run(&conn, &parent.id).unwrap().unwrap();
        assert_eq!(parent.status, RunStatus::PausedUsageLimit);
        assert!(!parent.auto_resume_enabled);
    }

    #[tokio::test]
    async fn test_paused_without_auto_resume_left_alone() {
        let h = harness();
        let parent = Run::new("shell", "Shell", None, "true", "sonnet", &h.project);
        {
            let conn = h.storage.connection().unwrap();
            storage::insert_run(&conn, &parent).unwrap();
            storage::mark_running(&conn, &parent.id, 1, chrono::Utc::now()).unwrap();
            storage::mark_paused(
                &conn,
                &parent.id,
                chrono::Utc::now() - chrono::Duration::seconds(5),
            )
            .unwrap();
        }

        h.scheduler.poll_once().await.unwrap();

        let conn = h.storage.connection().unwrap();
        assert!(storage::children_of(&conn, &parent.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_loop_respects_shutdown() {
        let h = harness();
        let (tx, rx) = watch::channel(false);

        let scheduler = h.scheduler;
        let task = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
