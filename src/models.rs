use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::constants;

/// Current status of a task in the execution pipeline.
///
/// `Waiting` is reachable only through the orchestrator, for tasks that have
/// at least one declared dependency. Direct submissions go straight from
/// `Pending` to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other:?}")),
        }
    }
}

/// Abstract quality/latency class for a task. Maps to a per-tier timeout
/// budget; it carries no other execution semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    #[default]
    Balanced,
    Deep,
}

impl ModelTier {
    /// The per-task deadline for this tier.
    pub fn timeout_budget(self) -> Duration {
        match self {
            Self::Fast => constants::FAST_TIER_TIMEOUT,
            Self::Balanced => constants::BALANCED_TIER_TIMEOUT,
            Self::Deep => constants::DEEP_TIER_TIMEOUT,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Deep => "deep",
        };
        f.write_str(s)
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "deep" => Ok(Self::Deep),
            other => Err(format!("unknown model tier: {other:?}")),
        }
    }
}

/// Terminal outcome attached to a task's one-shot completion event.
///
/// Dependency gating in the orchestrator reads only this value; anything
/// other than `Completed` propagates a skip to the successors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl From<TaskOutcome> for TaskStatus {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Completed => TaskStatus::Completed,
            TaskOutcome::Failed => TaskStatus::Failed,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
            TaskOutcome::Skipped => TaskStatus::Skipped,
        }
    }
}

/// A persisted task row.
///
/// Invariants (enforced by the store on every mutation):
/// - `started_at` is non-null iff the task ever entered `running`;
///   `ended_at` is set iff the status is terminal.
/// - Exactly one of `final_summary` / `error_message` is non-null in a
///   terminal state; both are null otherwise.
/// - `summary_log_path` / `detailed_log_path` are set at insert and never
///   rewritten.
/// - `last_action` monotonically advances and is never cleared once set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub status: TaskStatus,
    pub model_tier: ModelTier,
    pub working_dir: String,
    pub system_prompt: Option<String>,
    pub execution_prompt: String,
    pub summary_log_path: String,
    pub detailed_log_path: String,
    pub last_action: Option<String>,
    pub final_summary: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub worker_pid: Option<i64>,
    pub agent_session_id: Option<String>,
    pub orchestration_id: Option<i64>,
    pub task_identifier: Option<String>,
    pub depends_on: Vec<String>,
    pub wait_after_dependencies: f64,
}

impl FromRow<'_, SqliteRow> for Task {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let status: String = row.try_get("status")?;
        let tier: String = row.try_get("model_tier")?;
        let depends_on: String = row.try_get("depends_on")?;
        Ok(Self {
            id: row.try_get("id")?,
            status: status
                .parse()
                .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            model_tier: tier
                .parse()
                .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            working_dir: row.try_get("working_dir")?,
            system_prompt: row.try_get("system_prompt")?,
            execution_prompt: row.try_get("execution_prompt")?,
            summary_log_path: row.try_get("summary_log_path")?,
            detailed_log_path: row.try_get("detailed_log_path")?,
            last_action: row.try_get("last_action")?,
            final_summary: row.try_get("final_summary")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            worker_pid: row.try_get("worker_pid")?,
            agent_session_id: row.try_get("agent_session_id")?,
            orchestration_id: row.try_get("orchestration_id")?,
            task_identifier: row.try_get("task_identifier")?,
            depends_on: serde_json::from_str(&depends_on)
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            wait_after_dependencies: row.try_get("wait_after_dependencies")?,
        })
    }
}

/// Inputs for creating a single task. Defaults applied by the loose surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub execution_prompt: String,
    pub working_dir: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model_tier: ModelTier,
}

/// One member of an orchestration batch: task inputs plus the declared
/// dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_identifier: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub wait_after_dependencies: f64,
    #[serde(flatten)]
    pub task: NewTask,
}

/// Status of an orchestration (a named batch of tasks with declared
/// dependencies). Terminal states are derived from member outcomes, except
/// `Cancelled` which is set on explicit cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OrchestrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for OrchestrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown orchestration status: {other:?}")),
        }
    }
}

/// A persisted orchestration row with its aggregate counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orchestration {
    pub id: i64,
    pub status: OrchestrationStatus,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl FromRow<'_, SqliteRow> for Orchestration {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            status: status
                .parse()
                .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            total_tasks: row.try_get("total_tasks")?,
            completed_tasks: row.try_get("completed_tasks")?,
            failed_tasks: row.try_get("failed_tasks")?,
            skipped_tasks: row.try_get("skipped_tasks")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }
}

/// A structured message streamed by the external agent.
///
/// The wire format of the agent is not part of this crate's contract; the
/// CLI client decodes whatever the agent emits into this tagged set and the
/// executor pattern-matches on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Agent session opened; carries the agent's own session identity.
    SessionStart { session_id: String },
    UserText { text: String },
    AssistantText { text: String },
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    /// Tool output observed by the agent. A non-zero exit inside the payload
    /// is agent-observed data, never a task failure.
    ToolResult {
        content: serde_json::Value,
        is_error: bool,
    },
    Final { summary: String, is_error: bool },
}

impl AgentMessage {
    /// One-line summary for the task's summary log; `None` for message
    /// types that are not notable events.
    pub fn action_line(&self) -> Option<String> {
        match self {
            Self::SessionStart { session_id } => {
                Some(format!("agent session started ({session_id})"))
            }
            Self::ToolUse { name, input } => {
                let preview = tool_input_preview(input);
                if preview.is_empty() {
                    Some(format!("using tool {name}"))
                } else {
                    Some(format!("using tool {name}: {preview}"))
                }
            }
            _ => None,
        }
    }
}

/// Compress a tool-use input blob into a short human-readable fragment.
fn tool_input_preview(input: &serde_json::Value) -> String {
    const PREVIEW_LEN: usize = 80;
    let raw = match input {
        serde_json::Value::Object(map) => {
            // Prefer the fields agents conventionally put the interesting
            // part in; fall back to the whole blob.
            ["command", "file_path", "path", "pattern", "url"]
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_str()).map(str::to_owned))
                .unwrap_or_else(|| input.to_string())
        }
        other => other.to_string(),
    };
    let mut preview: String = raw.chars().take(PREVIEW_LEN).collect();
    if raw.chars().count() > PREVIEW_LEN {
        preview.push('…');
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_display() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Waiting,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Skipped,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Waiting.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
    }

    #[test]
    fn tier_timeout_budgets_are_ordered() {
        assert!(ModelTier::Fast.timeout_budget() < ModelTier::Balanced.timeout_budget());
        assert!(ModelTier::Balanced.timeout_budget() < ModelTier::Deep.timeout_budget());
    }

    #[test]
    fn tool_use_action_line_prefers_command_field() {
        let msg = AgentMessage::ToolUse {
            name: "Bash".to_string(),
            input: serde_json::json!({"command": "cargo test", "timeout": 120}),
        };
        assert_eq!(
            msg.action_line().unwrap(),
            "using tool Bash: cargo test"
        );
    }

    #[test]
    fn assistant_text_is_not_an_action() {
        let msg = AgentMessage::AssistantText {
            text: "thinking".to_string(),
        };
        assert!(msg.action_line().is_none());
    }
}
