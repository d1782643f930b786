//! Database query implementations

use crate::error::Result;
use crate::types::*;
use rusqlite::{params, Connection, OptionalExtension};

// ===== Row mapping =====

const RUN_COLUMNS: &str = "id, agent_id, agent_name, agent_icon, task, model, project_path, \
     session_id, status, pid, process_started_at, scheduled_start_time, created_at, \
     completed_at, usage_limit_reset_time, auto_resume_enabled, resume_count, \
     parent_run_id, error_message";

fn parse_ts(col: usize, s: String) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_ts_opt(
    col: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<chrono::DateTime<chrono::Utc>>> {
    s.map(|s| parse_ts(col, s)).transpose()
}

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let status_raw: String = row.get(8)?;
    let status = RunStatus::parse(&status_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Run {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        agent_name: row.get(2)?,
        agent_icon: row.get(3)?,
        task: row.get(4)?,
        model: row.get(5)?,
        project_path: row.get(6)?,
        session_id: row.get(7)?,
        status,
        pid: row.get::<_, Option<i64>>(9)?.map(|p| p as u32),
        process_started_at: parse_ts_opt(10, row.get(10)?)?,
        scheduled_start_time: parse_ts_opt(11, row.get(11)?)?,
        created_at: parse_ts(12, row.get(12)?)?,
        completed_at: parse_ts_opt(13, row.get(13)?)?,
        usage_limit_reset_time: parse_ts_opt(14, row.get(14)?)?,
        auto_resume_enabled: row.get::<_, i64>(15)? != 0,
        resume_count: row.get::<_, i64>(16)? as u32,
        parent_run_id: row.get(17)?,
        error_message: row.get(18)?,
    })
}

// ===== Run queries =====

/// Insert a new run row
pub fn insert_run(conn: &Connection, run: &Run) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO runs ({RUN_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"),
        params![
            run.id,
            run.agent_id,
            run.agent_name,
            run.agent_icon,
            run.task,
            run.model,
            run.project_path,
            run.session_id,
            run.status.as_str(),
            run.pid.map(|p| p as i64),
            run.process_started_at.map(|t| t.to_rfc3339()),
            run.scheduled_start_time.map(|t| t.to_rfc3339()),
            run.created_at.to_rfc3339(),
            run.completed_at.map(|t| t.to_rfc3339()),
            run.usage_limit_reset_time.map(|t| t.to_rfc3339()),
            run.auto_resume_enabled as i64,
            run.resume_count as i64,
            run.parent_run_id,
            run.error_message,
        ],
    )?;
    Ok(())
}

/// Get a run by id
pub fn get_run(conn: &Connection, run_id: &str) -> Result<Option<Run>> {
    let result = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"),
            params![run_id],
            map_run,
        )
        .optional()?;
    Ok(result)
}

/// List runs, newest first
pub fn list_runs(conn: &Connection, limit: usize, offset: usize) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC LIMIT ? OFFSET ?"
    ))?;
    let runs = stmt
        .query_map(params![limit as i64, offset as i64], map_run)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(runs)
}

/// Runs currently in the given status, oldest first
pub fn runs_by_status(conn: &Connection, status: RunStatus) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE status = ? ORDER BY created_at"
    ))?;
    let runs = stmt
        .query_map(params![status.as_str()], map_run)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(runs)
}

/// Runs for an agent, newest first
pub fn runs_by_agent(conn: &Connection, agent_id: &str) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE agent_id = ? ORDER BY created_at DESC"
    ))?;
    let runs = stmt
        .query_map(params![agent_id], map_run)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(runs)
}

/// Direct children of a run in the resume lineage
pub fn children_of(conn: &Connection, run_id: &str) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE parent_run_id = ? ORDER BY created_at"
    ))?;
    let runs = stmt
        .query_map(params![run_id], map_run)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(runs)
}

/// Scheduled runs whose start time has passed
pub fn due_scheduled(
    conn: &Connection,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM runs \
         WHERE status = 'scheduled' AND scheduled_start_time <= ? \
         ORDER BY scheduled_start_time"
    ))?;
    let runs = stmt
        .query_map(params![now.to_rfc3339()], map_run)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(runs)
}

/// Paused runs eligible for automatic resumption
pub fn due_auto_resume(
    conn: &Connection,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM runs \
         WHERE status = 'paused_usage_limit' AND auto_resume_enabled = 1 \
           AND usage_limit_reset_time IS NOT NULL AND usage_limit_reset_time <= ? \
         ORDER BY usage_limit_reset_time"
    ))?;
    let runs = stmt
        .query_map(params![now.to_rfc3339()], map_run)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(runs)
}

/// Record the child process's own session identifier
pub fn set_session_id(conn: &Connection, run_id: &str, session_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE runs SET session_id = ? WHERE id = ?",
        params![session_id, run_id],
    )?;
    Ok(())
}

// ===== Compare-and-set transitions =====
//
// Every status change verifies the expected prior status in the WHERE
// clause and writes the side columns in the same statement, so racing
// components cannot lose updates. Each helper returns whether this caller
// won the transition.

/// pending -> running
pub fn mark_running(
    conn: &Connection,
    run_id: &str,
    pid: u32,
    started_at: chrono::DateTime<chrono::Utc>,
) -> Result<bool> {
    let n = conn.execute(
        "UPDATE runs SET status = 'running', pid = ?, process_started_at = ? \
         WHERE id = ? AND status = 'pending'",
        params![pid as i64, started_at.to_rfc3339(), run_id],
    )?;
    Ok(n == 1)
}

/// running -> completed
pub fn mark_completed(conn: &Connection, run_id: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE runs SET status = 'completed', pid = NULL, completed_at = ? \
         WHERE id = ? AND status = 'running'",
        params![chrono::Utc::now().to_rfc3339(), run_id],
    )?;
    Ok(n == 1)
}

/// expected -> failed, recording the reason
pub fn mark_failed(
    conn: &Connection,
    run_id: &str,
    expected: RunStatus,
    message: &str,
) -> Result<bool> {
    let n = conn.execute(
        "UPDATE runs SET status = 'failed', pid = NULL, completed_at = ?, error_message = ? \
         WHERE id = ? AND status = ?",
        params![
            chrono::Utc::now().to_rfc3339(),
            message,
            run_id,
            expected.as_str()
        ],
    )?;
    Ok(n == 1)
}

/// running -> cancelled
pub fn mark_cancelled(conn: &Connection, run_id: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE runs SET status = 'cancelled', pid = NULL, completed_at = ? \
         WHERE id = ? AND status = 'running'",
        params![chrono::Utc::now().to_rfc3339(), run_id],
    )?;
    Ok(n == 1)
}

/// running -> paused_usage_limit, recording the reset time. Not a terminal
/// transition, so completed_at stays unset.
pub fn mark_paused(
    conn: &Connection,
    run_id: &str,
    reset_time: chrono::DateTime<chrono::Utc>,
) -> Result<bool> {
    let n = conn.execute(
        "UPDATE runs SET status = 'paused_usage_limit', pid = NULL, usage_limit_reset_time = ? \
         WHERE id = ? AND status = 'running'",
        params![reset_time.to_rfc3339(), run_id],
    )?;
    Ok(n == 1)
}

/// scheduled -> pending, claiming the row for execution. Only one poller
/// can win; later polls no longer match.
pub fn claim_scheduled(conn: &Connection, run_id: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE runs SET status = 'pending' WHERE id = ? AND status = 'scheduled'",
        params![run_id],
    )?;
    Ok(n == 1)
}

/// Toggle automatic resumption for a run
pub fn set_auto_resume(conn: &Connection, run_id: &str, enabled: bool) -> Result<()> {
    conn.execute(
        "UPDATE runs SET auto_resume_enabled = ? WHERE id = ?",
        params![enabled as i64, run_id],
    )?;
    Ok(())
}

/// Claim a paused run for auto-resume by clearing the flag. The row's
/// status is left untouched so the audit chain stays intact.
pub fn claim_auto_resume(conn: &Connection, run_id: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE runs SET auto_resume_enabled = 0 \
         WHERE id = ? AND status = 'paused_usage_limit' AND auto_resume_enabled = 1",
        params![run_id],
    )?;
    Ok(n == 1)
}

// ===== Agent queries =====

/// Insert or update an agent configuration
pub fn upsert_agent(conn: &Connection, agent: &Agent) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO agents (id, name, description, command, args, env, icon, model,
                            allow_file_read, allow_file_write, allow_network, enabled,
                            created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            command = excluded.command,
            args = excluded.args,
            env = excluded.env,
            icon = excluded.icon,
            model = excluded.model,
            allow_file_read = excluded.allow_file_read,
            allow_file_write = excluded.allow_file_write,
            allow_network = excluded.allow_network,
            enabled = excluded.enabled,
            updated_at = excluded.updated_at
        "#,
        params![
            agent.id,
            agent.name,
            agent.description,
            agent.command,
            serde_json::to_string(&agent.args)?,
            serde_json::to_string(&agent.env)?,
            agent.icon,
            agent.model,
            agent.allow_file_read as i64,
            agent.allow_file_write as i64,
            agent.allow_network as i64,
            agent.enabled as i64,
            agent.created_at.to_rfc3339(),
            agent.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn map_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let args: Option<String> = row.get(4)?;
    let env: Option<String> = row.get(5)?;
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        command: row.get(3)?,
        args: args
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        env: env
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        icon: row.get(6)?,
        model: row.get(7)?,
        allow_file_read: row.get::<_, i64>(8)? != 0,
        allow_file_write: row.get::<_, i64>(9)? != 0,
        allow_network: row.get::<_, i64>(10)? != 0,
        enabled: row.get::<_, i64>(11)? != 0,
        created_at: parse_ts(12, row.get(12)?)?,
        updated_at: parse_ts(13, row.get(13)?)?,
    })
}

const AGENT_COLUMNS: &str = "id, name, description, command, args, env, icon, model, \
     allow_file_read, allow_file_write, allow_network, enabled, created_at, updated_at";

/// Get an agent by id
pub fn get_agent(conn: &Connection, agent_id: &str) -> Result<Option<Agent>> {
    let result = conn
        .query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?"),
            params![agent_id],
            map_agent,
        )
        .optional()?;
    Ok(result)
}

/// All agents, name order
pub fn list_agents(conn: &Connection) -> Result<Vec<Agent>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY name"))?;
    let agents = stmt
        .query_map([], map_agent)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(agents)
}

/// Delete an agent configuration
pub fn delete_agent(conn: &Connection, agent_id: &str) -> Result<()> {
    conn.execute("DELETE FROM agents WHERE id = ?", params![agent_id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::storage::run_migrations(&conn).unwrap();
        conn
    }

    fn sample_run() -> Run {
        Run::new("agent-1", "Agent One", None, "build the thing", "sonnet", "/tmp/project")
    }

    #[test]
    fn test_run_crud() {
        let conn = setup_db();
        let run = sample_run();

        insert_run(&conn, &run).unwrap();

        let fetched = get_run(&conn, &run.id).unwrap().unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.status, RunStatus::Pending);
        assert_eq!(fetched.pid, None);
        assert_eq!(fetched.task, "build the thing");

        assert!(get_run(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_running_transition_sets_pid() {
        let conn = setup_db();
        let run = sample_run();
        insert_run(&conn, &run).unwrap();

        assert!(mark_running(&conn, &run.id, 4242, chrono::Utc::now()).unwrap());

        let fetched = get_run(&conn, &run.id).unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Running);
        assert_eq!(fetched.pid, Some(4242));
        assert!(fetched.process_started_at.is_some());
    }

    #[test]
    fn test_pid_cleared_on_every_exit_path() {
        let conn = setup_db();

        for finish in [
            mark_completed as fn(&Connection, &str) -> Result<bool>,
            mark_cancelled,
        ] {
            let run = sample_run();
            insert_run(&conn, &run).unwrap();
            mark_running(&conn, &run.id, 99, chrono::Utc::now()).unwrap();

            assert!(finish(&conn, &run.id).unwrap());
            let fetched = get_run(&conn, &run.id).unwrap().unwrap();
            assert_eq!(fetched.pid, None);
            assert!(fetched.completed_at.is_some());
        }

        // Pause also clears pid but stamps no completion.
        let run = sample_run();
        insert_run(&conn, &run).unwrap();
        mark_running(&conn, &run.id, 99, chrono::Utc::now()).unwrap();
        assert!(mark_paused(&conn, &run.id, chrono::Utc::now()).unwrap());
        let fetched = get_run(&conn, &run.id).unwrap().unwrap();
        assert_eq!(fetched.pid, None);
        assert!(fetched.completed_at.is_none());
        assert!(fetched.usage_limit_reset_time.is_some());
    }

    #[test]
    fn test_cas_loser_detected() {
        let conn = setup_db();
        let run = sample_run();
        insert_run(&conn, &run).unwrap();
        mark_running(&conn, &run.id, 7, chrono::Utc::now()).unwrap();

        // Pause wins the race.
        assert!(mark_paused(&conn, &run.id, chrono::Utc::now()).unwrap());
        // The natural-exit completion loses and must observe that.
        assert!(!mark_completed(&conn, &run.id).unwrap());
        assert!(!mark_failed(&conn, &run.id, RunStatus::Running, "boom").unwrap());

        let fetched = get_run(&conn, &run.id).unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::PausedUsageLimit);
    }

    #[test]
    fn test_due_scheduled_and_claim_once() {
        let conn = setup_db();
        let run = sample_run().scheduled(chrono::Utc::now() - chrono::Duration::minutes(1));
        insert_run(&conn, &run).unwrap();

        let due = due_scheduled(&conn, chrono::Utc::now()).unwrap();
        assert_eq!(due.len(), 1);

        assert!(claim_scheduled(&conn, &run.id).unwrap());
        // A second poll sees nothing and a second claim loses.
        assert!(due_scheduled(&conn, chrono::Utc::now()).unwrap().is_empty());
        assert!(!claim_scheduled(&conn, &run.id).unwrap());
    }

    #[test]
    fn test_due_auto_resume_and_claim_once() {
        let conn = setup_db();
        let mut run = sample_run();
        run.auto_resume_enabled = true;
        insert_run(&conn, &run).unwrap();
        mark_running(&conn, &run.id, 1, chrono::Utc::now()).unwrap();
        mark_paused(&conn, &run.id, chrono::Utc::now() - chrono::Duration::seconds(5)).unwrap();

        let due = due_auto_resume(&conn, chrono::Utc::now()).unwrap();
        assert_eq!(due.len(), 1);

        assert!(claim_auto_resume(&conn, &run.id).unwrap());
        assert!(due_auto_resume(&conn, chrono::Utc::now()).unwrap().is_empty());
        assert!(!claim_auto_resume(&conn, &run.id).unwrap());

        // Status stays paused; only the flag was cleared.
        let fetched = get_run(&conn, &run.id).unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::PausedUsageLimit);
        assert!(!fetched.auto_resume_enabled);
    }

    #[test]
    fn test_children_of() {
        let conn = setup_db();
        let mut parent = sample_run();
        parent.status = RunStatus::PausedUsageLimit;
        insert_run(&conn, &parent).unwrap();

        let child = Run::resuming(&parent);
        insert_run(&conn, &child).unwrap();

        let children = children_of(&conn, &parent.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].resume_count, 1);
        assert_eq!(children[0].parent_run_id.as_deref(), Some(parent.id.as_str()));
    }

    #[test]
    fn test_unknown_status_rejected_at_boundary() {
        let conn = setup_db();
        let run = sample_run();
        insert_run(&conn, &run).unwrap();
        conn.execute(
            "UPDATE runs SET status = 'mystery' WHERE id = ?",
            params![run.id],
        )
        .unwrap();

        assert!(get_run(&conn, &run.id).is_err());
    }

    #[test]
    fn test_agent_crud() {
        let conn = setup_db();
        let mut agent = Agent::new("reviewer", "Reviewer", "claude").with_model("opus");
        upsert_agent(&conn, &agent).unwrap();

        let fetched = get_agent(&conn, "reviewer").unwrap().unwrap();
        assert_eq!(fetched.model, "opus");

        agent.name = "Code Reviewer".to_string();
        upsert_agent(&conn, &agent).unwrap();
        let fetched = get_agent(&conn, "reviewer").unwrap().unwrap();
        assert_eq!(fetched.name, "Code Reviewer");
        assert_eq!(list_agents(&conn).unwrap().len(), 1);

        delete_agent(&conn, "reviewer").unwrap();
        assert!(get_agent(&conn, "reviewer").unwrap().is_none());
    }
}
