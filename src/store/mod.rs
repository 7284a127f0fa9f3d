//! Sole gateway to persistent state.
//!
//! Every mutation happens here, inside a short transaction on a fresh
//! SQLite session. Readers run without locks. The single-file engine is the
//! serializer; layering a connection pool on top of it only adds race
//! windows, so each operation opens its own connection and lets SQLite's
//! busy handler arbitrate.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tracing::{debug, info};

use crate::models::{
    NewTask, Orchestration, OrchestrationStatus, Task, TaskSpec, TaskStatus,
};
use crate::orchestrator::dag;
use crate::{logsink, CapstanError, Result};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS orchestrations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        status TEXT NOT NULL,
        total_tasks INTEGER NOT NULL,
        completed_tasks INTEGER NOT NULL DEFAULT 0,
        failed_tasks INTEGER NOT NULL DEFAULT 0,
        skipped_tasks INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        started_at TEXT,
        ended_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        status TEXT NOT NULL,
        model_tier TEXT NOT NULL,
        working_dir TEXT NOT NULL,
        system_prompt TEXT,
        execution_prompt TEXT NOT NULL,
        summary_log_path TEXT NOT NULL DEFAULT '',
        detailed_log_path TEXT NOT NULL DEFAULT '',
        last_action TEXT,
        final_summary TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        ended_at TEXT,
        worker_pid INTEGER,
        agent_session_id TEXT,
        orchestration_id INTEGER REFERENCES orchestrations(id),
        task_identifier TEXT,
        depends_on TEXT NOT NULL DEFAULT '[]',
        wait_after_dependencies REAL NOT NULL DEFAULT 0,
        UNIQUE(orchestration_id, task_identifier)
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_orchestration ON tasks(orchestration_id)",
];

/// Fields patched alongside a status transition.
#[derive(Debug, Default, Clone)]
pub struct TransitionPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub worker_pid: Option<i64>,
}

/// Terminal outcome written by `finalize`.
///
/// The enum shape carries the terminal-exclusivity invariant: a completed
/// task gets `final_summary`, every other terminal state gets
/// `error_message` (possibly a short placeholder for skips and cancels).
#[derive(Debug, Clone)]
pub enum TaskTermination {
    Completed { final_summary: String },
    Failed { error_message: String },
    Skipped { reason: String },
    Cancelled { reason: String },
}

impl TaskTermination {
    fn status(&self) -> TaskStatus {
        match self {
            Self::Completed { .. } => TaskStatus::Completed,
            Self::Failed { .. } => TaskStatus::Failed,
            Self::Skipped { .. } => TaskStatus::Skipped,
            Self::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }

    fn columns(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Self::Completed { final_summary } => (Some(final_summary), None),
            Self::Failed { error_message } => (None, Some(error_message)),
            Self::Skipped { reason } | Self::Cancelled { reason } => (None, Some(reason)),
        }
    }
}

pub struct Store {
    options: SqliteConnectOptions,
    tasks_log_dir: PathBuf,
}

impl Store {
    /// Open (creating if necessary) the state file and verify its
    /// integrity. A corrupted state file is fatal: the service refuses to
    /// run rather than operate on damaged history.
    pub async fn open(db_path: &Path, tasks_log_dir: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(tasks_log_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true)
            .disable_statement_logging();

        let store = Self {
            options,
            tasks_log_dir: tasks_log_dir.to_path_buf(),
        };

        let mut conn = store.conn().await?;
        let verdict: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&mut conn)
            .await?;
        if verdict != "ok" {
            return Err(CapstanError::Corruption(format!(
                "{}: {verdict}",
                db_path.display()
            )));
        }
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut conn).await?;
        }
        conn.close().await?;

        info!("State file opened at {}", db_path.display());
        Ok(store)
    }

    /// Every operation runs on a fresh session; the file is the serializer.
    async fn conn(&self) -> Result<SqliteConnection> {
        Ok(self.options.connect().await?)
    }

    /// Allocate an id, precompute the log paths, and write the row in
    /// `pending`, all in one transaction, so the paths are set at insert
    /// and never rewritten.
    pub async fn create_task(&self, new: &NewTask) -> Result<Task> {
        let mut conn = self.conn().await?;
        let mut tx = conn.begin().await?;
        let now = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO tasks (status, model_tier, working_dir, system_prompt, \
             execution_prompt, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(TaskStatus::Pending.to_string())
        .bind(new.model_tier.to_string())
        .bind(&new.working_dir)
        .bind(&new.system_prompt)
        .bind(&new.execution_prompt)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let id = inserted.last_insert_rowid();

        let paths = logsink::task_log_paths(&self.tasks_log_dir, id, &new.working_dir, now);
        sqlx::query("UPDATE tasks SET summary_log_path = ?1, detailed_log_path = ?2 WHERE id = ?3")
            .bind(paths.summary.to_string_lossy().into_owned())
            .bind(paths.detailed.to_string_lossy().into_owned())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Created task {id}");
        self.get_task(id).await
    }

    /// Validate the batch as a DAG and insert the orchestration plus every
    /// member task atomically. Members with at least one dependency start
    /// in `waiting`; roots start in `pending`.
    pub async fn create_orchestration(
        &self,
        specs: &[TaskSpec],
    ) -> Result<(Orchestration, Vec<Task>)> {
        dag::validate(specs)?;

        let mut conn = self.conn().await?;
        let mut tx = conn.begin().await?;
        let now = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO orchestrations (status, total_tasks, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(OrchestrationStatus::Pending.to_string())
        .bind(specs.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let orch_id = inserted.last_insert_rowid();

        let mut task_ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let status = if spec.depends_on.is_empty() {
                TaskStatus::Pending
            } else {
                TaskStatus::Waiting
            };
            let inserted = sqlx::query(
                "INSERT INTO tasks (status, model_tier, working_dir, system_prompt, \
                 execution_prompt, created_at, orchestration_id, task_identifier, \
                 depends_on, wait_after_dependencies) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .bind(status.to_string())
            .bind(spec.task.model_tier.to_string())
            .bind(&spec.task.working_dir)
            .bind(&spec.task.system_prompt)
            .bind(&spec.task.execution_prompt)
            .bind(now)
            .bind(orch_id)
            .bind(&spec.task_identifier)
            .bind(serde_json::to_string(&spec.depends_on)?)
            .bind(spec.wait_after_dependencies)
            .execute(&mut *tx)
            .await?;
            let id = inserted.last_insert_rowid();

            let paths =
                logsink::task_log_paths(&self.tasks_log_dir, id, &spec.task.working_dir, now);
            sqlx::query(
                "UPDATE tasks SET summary_log_path = ?1, detailed_log_path = ?2 WHERE id = ?3",
            )
            .bind(paths.summary.to_string_lossy().into_owned())
            .bind(paths.detailed.to_string_lossy().into_owned())
            .bind(id)
            .execute(&mut *tx)
            .await?;
            task_ids.push(id);
        }

        tx.commit().await?;
        info!(
            "Created orchestration {orch_id} with {} member tasks",
            specs.len()
        );

        let orch = self.get_orchestration(orch_id).await?;
        let mut tasks = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            tasks.push(self.get_task(id).await?);
        }
        Ok((orch, tasks))
    }

    /// Compare-and-set on status. Fails with `InvalidTransition` when the
    /// current status does not match `from`; timestamps and patched fields
    /// update atomically with the status.
    pub async fn transition(
        &self,
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
        patch: TransitionPatch,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, \
             started_at = COALESCE(?2, started_at), \
             worker_pid = COALESCE(?3, worker_pid) \
             WHERE id = ?4 AND status = ?5",
        )
        .bind(to.to_string())
        .bind(patch.started_at)
        .bind(patch.worker_pid)
        .bind(task_id)
        .bind(from.to_string())
        .execute(&mut conn)
        .await?;

        if result.rows_affected() == 0 {
            let actual = self.get_task(task_id).await?.status;
            return Err(CapstanError::InvalidTransition {
                task_id,
                expected: from.to_string(),
                actual: actual.to_string(),
            });
        }
        debug!("Task {task_id}: {from} -> {to}");
        Ok(())
    }

    /// Advance the `last_action` cache. The cache only ever moves forward:
    /// callers pass the newest line and there is no way to clear it.
    pub async fn update_last_action(&self, task_id: i64, line: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query("UPDATE tasks SET last_action = ?1 WHERE id = ?2")
            .bind(line)
            .bind(task_id)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Record the agent's self-reported session identity.
    pub async fn set_agent_session(&self, task_id: i64, session_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query("UPDATE tasks SET agent_session_id = ?1 WHERE id = ?2")
            .bind(session_id)
            .bind(task_id)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Move a task to a terminal state, setting `ended_at` and exactly one
    /// of `final_summary` / `error_message`.
    ///
    /// A task that is already terminal is left untouched and `false` is
    /// returned, which makes cancellation idempotent at the store level.
    pub async fn finalize(&self, task_id: i64, termination: &TaskTermination) -> Result<bool> {
        let (final_summary, error_message) = termination.columns();
        let mut conn = self.conn().await?;
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, final_summary = ?2, error_message = ?3, \
             ended_at = ?4 \
             WHERE id = ?5 AND status IN ('pending', 'waiting', 'running')",
        )
        .bind(termination.status().to_string())
        .bind(final_summary)
        .bind(error_message)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&mut conn)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            debug!("Task {task_id} finalized as {}", termination.status());
        }
        Ok(changed)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task> {
        let mut conn = self.conn().await?;
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&mut conn)
            .await?
            .ok_or_else(|| CapstanError::NotFound(format!("task {task_id}")))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut conn = self.conn().await?;
        Ok(
            sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY id ASC")
                .fetch_all(&mut conn)
                .await?,
        )
    }

    pub async fn get_orchestration(&self, orch_id: i64) -> Result<Orchestration> {
        let mut conn = self.conn().await?;
        sqlx::query_as::<_, Orchestration>("SELECT * FROM orchestrations WHERE id = ?1")
            .bind(orch_id)
            .fetch_optional(&mut conn)
            .await?
            .ok_or_else(|| CapstanError::NotFound(format!("orchestration {orch_id}")))
    }

    pub async fn list_orchestrations(&self) -> Result<Vec<Orchestration>> {
        let mut conn = self.conn().await?;
        Ok(sqlx::query_as::<_, Orchestration>(
            "SELECT * FROM orchestrations ORDER BY id ASC",
        )
        .fetch_all(&mut conn)
        .await?)
    }

    pub async fn orchestration_members(&self, orch_id: i64) -> Result<Vec<Task>> {
        let mut conn = self.conn().await?;
        Ok(sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE orchestration_id = ?1 ORDER BY id ASC",
        )
        .bind(orch_id)
        .fetch_all(&mut conn)
        .await?)
    }

    /// Recompute an orchestration's aggregate counts and derived status
    /// from its member rows. Called on every member-terminal event.
    pub async fn recompute_orchestration(&self, orch_id: i64) -> Result<Orchestration> {
        let members = self.orchestration_members(orch_id).await?;
        let current = self.get_orchestration(orch_id).await?;

        let total = members.len() as i64;
        let completed = count_status(&members, TaskStatus::Completed);
        let failed = count_status(&members, TaskStatus::Failed);
        let skipped = count_status(&members, TaskStatus::Skipped);
        let cancelled = count_status(&members, TaskStatus::Cancelled);
        let all_terminal = members.iter().all(|t| t.status.is_terminal());
        let any_started = members
            .iter()
            .any(|t| t.status == TaskStatus::Running || t.status.is_terminal());

        // Explicit cancel is sticky; the aggregate rule never overrides it.
        let status = if current.status == OrchestrationStatus::Cancelled {
            OrchestrationStatus::Cancelled
        } else if all_terminal {
            if failed > 0 {
                OrchestrationStatus::Failed
            } else if cancelled > 0 {
                OrchestrationStatus::Cancelled
            } else {
                OrchestrationStatus::Completed
            }
        } else if any_started {
            OrchestrationStatus::Running
        } else {
            OrchestrationStatus::Pending
        };

        let started_at = current.started_at.or(if any_started {
            Some(Utc::now())
        } else {
            None
        });
        let ended_at = current.ended_at.or(if status.is_terminal() {
            Some(Utc::now())
        } else {
            None
        });

        let mut conn = self.conn().await?;
        sqlx::query(
            "UPDATE orchestrations SET status = ?1, completed_tasks = ?2, failed_tasks = ?3, \
             skipped_tasks = ?4, total_tasks = ?5, started_at = ?6, ended_at = ?7 WHERE id = ?8",
        )
        .bind(status.to_string())
        .bind(completed)
        .bind(failed)
        .bind(skipped)
        .bind(total)
        .bind(started_at)
        .bind(ended_at)
        .bind(orch_id)
        .execute(&mut conn)
        .await?;

        self.get_orchestration(orch_id).await
    }

    /// Mark an orchestration cancelled. Member cleanup is the scheduler's
    /// job; this only pins the aggregate status.
    pub async fn mark_orchestration_cancelled(&self, orch_id: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            "UPDATE orchestrations SET status = 'cancelled', ended_at = COALESCE(ended_at, ?1) \
             WHERE id = ?2 AND status NOT IN ('completed', 'failed')",
        )
        .bind(Utc::now())
        .bind(orch_id)
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    /// Rows left in non-terminal states by a previous process. The
    /// scheduler re-queues these on startup.
    pub async fn load_pending_on_startup(&self) -> Result<Vec<Task>> {
        let mut conn = self.conn().await?;
        Ok(sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE status IN ('pending', 'waiting', 'running') ORDER BY id ASC",
        )
        .fetch_all(&mut conn)
        .await?)
    }

    /// Non-terminal orchestrations that must be re-armed on startup.
    pub async fn load_open_orchestrations(&self) -> Result<Vec<Orchestration>> {
        let mut conn = self.conn().await?;
        Ok(sqlx::query_as::<_, Orchestration>(
            "SELECT * FROM orchestrations WHERE status IN ('pending', 'running') ORDER BY id ASC",
        )
        .fetch_all(&mut conn)
        .await?)
    }
}

fn count_status(tasks: &[Task], status: TaskStatus) -> i64 {
    tasks.iter().filter(|t| t.status == status).count() as i64
}
