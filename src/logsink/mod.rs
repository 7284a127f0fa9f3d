//! Per-task append-only log writers.
//!
//! Each task owns two files for its whole lifetime: a summary log with one
//! emoji-tagged line per notable event, and a detailed log holding full
//! serialized agent messages. Writers are never shared across tasks, every
//! write ends in a newline, and the closer runs exactly once per task.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::constants::LOG_CONTEXT_SLUG_MAX;
use crate::models::Task;
use crate::{CapstanError, Result};

// Emoji-tagged event codes used as summary-line prefixes.
pub const CODE_HEADER: &str = "📋";
pub const CODE_STATUS: &str = "🚦";
pub const CODE_TOOL: &str = "🔧";
pub const CODE_RETRY: &str = "🔁";
pub const CODE_DONE: &str = "✅";
pub const CODE_FAIL: &str = "❌";
pub const CODE_RECOVERY: &str = "🩹";

/// Precomputed log file locations for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLogPaths {
    pub summary: PathBuf,
    pub detailed: PathBuf,
}

/// Generate the per-task log paths:
/// `task_{id}_{context}_{yyyymmdd_HHMM}_{summary|detailed}.log`.
///
/// `{context}` is the basename of the working directory with unsafe
/// characters replaced and the result truncated, so the filename never
/// exceeds the platform maximum.
pub fn task_log_paths(
    tasks_dir: &Path,
    task_id: i64,
    working_dir: &str,
    at: DateTime<Utc>,
) -> TaskLogPaths {
    let context = context_slug(working_dir);
    let stamp = at.format("%Y%m%d_%H%M");
    TaskLogPaths {
        summary: tasks_dir.join(format!("task_{task_id}_{context}_{stamp}_summary.log")),
        detailed: tasks_dir.join(format!("task_{task_id}_{context}_{stamp}_detailed.log")),
    }
}

/// Basename of the working directory, non-alphanumeric characters replaced
/// with `_`, truncated to [`LOG_CONTEXT_SLUG_MAX`] characters.
pub fn context_slug(working_dir: &str) -> String {
    let basename = Path::new(working_dir)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let mut slug: String = basename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    slug.truncate(LOG_CONTEXT_SLUG_MAX);
    if slug.is_empty() {
        slug.push_str("root");
    }
    slug
}

/// Factory for per-task writers, rooted at the service's `tasks/` log
/// directory.
#[derive(Debug, Clone)]
pub struct LogSink {
    tasks_dir: PathBuf,
}

impl LogSink {
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
        }
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    /// Open both log files for a task, creating them in append mode. The
    /// paths were fixed when the row was inserted; this never invents new
    /// ones.
    pub async fn open(&self, task: &Task) -> Result<TaskLogs> {
        tokio::fs::create_dir_all(&self.tasks_dir).await?;
        let summary = open_append(Path::new(&task.summary_log_path)).await?;
        let detailed = open_append(Path::new(&task.detailed_log_path)).await?;
        debug!("Opened log pair for task {}", task.id);
        Ok(TaskLogs {
            task_id: task.id,
            summary: BufWriter::new(summary),
            detailed: BufWriter::new(detailed),
            closed: false,
        })
    }

    /// Append a crash-recovery marker to a task's logs without taking
    /// ownership of the pair. Used by the scheduler when it re-queues rows
    /// a previous process left in `running`.
    pub async fn append_recovery_marker(&self, task: &Task, note: &str) -> Result<()> {
        for path in [&task.summary_log_path, &task.detailed_log_path] {
            let mut file = open_append(Path::new(path)).await?;
            let line = format!("{CODE_RECOVERY} [{}] {note}\n", now_stamp());
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

async fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| CapstanError::LogSink {
            message: format!("cannot open {}: {e}", path.display()),
        })
}

fn now_stamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// The open writer pair for one task.
///
/// Consumed by [`TaskLogs::close`]; dropping an unclosed pair is a bug in
/// the executor and is logged as such.
#[derive(Debug)]
pub struct TaskLogs {
    task_id: i64,
    summary: BufWriter<File>,
    detailed: BufWriter<File>,
    closed: bool,
}

impl TaskLogs {
    /// One notable event: emoji code, timestamp, single line.
    pub async fn summary(&mut self, code: &str, text: &str) -> Result<()> {
        let line = format!("{code} [{}] {}\n", now_stamp(), text.trim_end());
        self.summary.write_all(line.as_bytes()).await?;
        self.summary.flush().await?;
        Ok(())
    }

    /// Full serialized payload (agent message, error context, probe dump).
    pub async fn detailed(&mut self, payload: &str) -> Result<()> {
        self.detailed.write_all(payload.trim_end().as_bytes()).await?;
        self.detailed.write_all(b"\n").await?;
        self.detailed.flush().await?;
        Ok(())
    }

    /// Flush and close both files. Runs exactly once; the consuming
    /// signature makes a second close unrepresentable.
    pub async fn close(mut self) -> Result<()> {
        self.summary.flush().await?;
        self.detailed.flush().await?;
        self.summary.get_mut().sync_all().await?;
        self.detailed.get_mut().sync_all().await?;
        self.closed = true;
        debug!("Closed log pair for task {}", self.task_id);
        Ok(())
    }
}

impl Drop for TaskLogs {
    fn drop(&mut self) {
        if !self.closed {
            // Buffered bytes were flushed after every write, so nothing is
            // lost, but the executor missed an exit path.
            warn!(
                "log pair for task {} dropped without explicit close",
                self.task_id
            );
        }
    }
}

/// Archive task logs older than `retention` into a dated `.tar.gz` and
/// remove the originals. Runs on the maintenance timer; file I/O happens on
/// the blocking pool.
pub async fn archive_old_logs(tasks_dir: PathBuf, retention: Duration) -> Result<usize> {
    let archived = tokio::task::spawn_blocking(move || archive_old_logs_blocking(&tasks_dir, retention))
        .await
        .map_err(|e| CapstanError::LogSink {
            message: format!("archive task panicked: {e}"),
        })??;
    if archived > 0 {
        info!("Archived {archived} expired task log files");
    }
    Ok(archived)
}

fn archive_old_logs_blocking(tasks_dir: &Path, retention: Duration) -> Result<usize> {
    if !tasks_dir.exists() {
        return Ok(0);
    }
    let cutoff = SystemTime::now() - retention;
    let mut expired = Vec::new();
    for entry in std::fs::read_dir(tasks_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path.extension().is_some_and(|ext| ext == "log");
        if !is_log {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            if modified < cutoff {
                expired.push(path);
            }
        }
    }
    if expired.is_empty() {
        return Ok(0);
    }

    let archive_path = tasks_dir.join(format!(
        "archive-{}.tar.gz",
        Utc::now().format("%Y%m%d")
    ));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&archive_path)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for path in &expired {
        if let Some(name) = path.file_name() {
            builder.append_path_with_name(path, name)?;
        }
    }
    builder.into_inner()?.finish()?;

    for path in &expired {
        std::fs::remove_file(path)?;
    }
    Ok(expired.len())
}
