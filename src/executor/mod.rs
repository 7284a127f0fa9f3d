//! Drives one task end-to-end.
//!
//! The executor owns a task from `pending` to a terminal state: it opens
//! the log pair, spawns the agent through the retry controller, streams and
//! classifies what comes back, and finalizes the row. Both log files close
//! exactly once on every exit path (success, failure, timeout, cancel).

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{collect_environment, AgentClient, AgentError, AgentRequest};
use crate::config::{RetryConfig, TierTimeouts};
use crate::constants::AGENT_BREAKER_KEY;
use crate::logsink::{
    LogSink, TaskLogs, CODE_DONE, CODE_FAIL, CODE_HEADER, CODE_RETRY, CODE_STATUS,
};
use crate::models::{AgentMessage, Task, TaskOutcome, TaskStatus};
use crate::resilience::{classify, FailureReport, RetryController, RetryPolicy};
use crate::store::{Store, TaskTermination, TransitionPatch};
use crate::{BreakerRegistry, Result};

/// Everything the single log-writer task appends for one task.
///
/// All writes and `last_action` updates for a task funnel through one
/// receiver, which is what guarantees they are observed in emission order.
enum TaskLogEvent {
    Agent(AgentMessage),
    Summary { code: &'static str, text: String },
    Detailed(String),
}

pub struct Executor {
    store: Arc<Store>,
    sink: Arc<LogSink>,
    agent: Arc<dyn AgentClient>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryConfig,
    timeouts: TierTimeouts,
    /// Binary name used only for the environmental probe on failure.
    binary_hint: String,
}

impl Executor {
    pub fn new(
        store: Arc<Store>,
        sink: Arc<LogSink>,
        agent: Arc<dyn AgentClient>,
        breakers: Arc<BreakerRegistry>,
        retry: RetryConfig,
        timeouts: TierTimeouts,
        binary_hint: String,
    ) -> Self {
        Self {
            store,
            sink,
            agent,
            breakers,
            retry,
            timeouts,
            binary_hint,
        }
    }

    /// Run one task to a terminal state. The returned outcome is what the
    /// orchestrator's completion event carries.
    pub async fn execute(&self, task_id: i64, cancel: CancellationToken) -> Result<TaskOutcome> {
        let task = self.store.get_task(task_id).await?;

        if let Err(e) = self
            .store
            .transition(
                task_id,
                TaskStatus::Pending,
                TaskStatus::Running,
                TransitionPatch {
                    started_at: Some(Utc::now()),
                    worker_pid: Some(std::process::id() as i64),
                },
            )
            .await
        {
            // A cancel that landed while the task was queued already
            // finalized the row; report that outcome instead of failing.
            let current = self.store.get_task(task_id).await?.status;
            if current == TaskStatus::Cancelled {
                debug!("Task {task_id} was cancelled before dispatch");
                return Ok(TaskOutcome::Cancelled);
            }
            return Err(e);
        }

        // Failing to open the log pair is fatal for the task, not the
        // service: finalize with a diagnostic pointing at the path.
        let logs = match self.sink.open(&task).await {
            Ok(logs) => logs,
            Err(e) => {
                error!("Task {task_id}: cannot open log files: {e}");
                let message = format!(
                    "[agent_generic] cannot open task log files | hint: check permissions on {}",
                    task.summary_log_path
                );
                self.store
                    .finalize(
                        task_id,
                        &TaskTermination::Failed {
                            error_message: message,
                        },
                    )
                    .await?;
                return Ok(TaskOutcome::Failed);
            }
        };

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(log_writer(
            task.id,
            logs,
            Arc::clone(&self.store),
            log_rx,
        ));

        let outcome = self.run_attempts(&task, &log_tx, cancel).await;

        // Everything below must happen on every path: report the outcome
        // into the logs, let the writer drain, close the pair.
        match &outcome {
            Ok(RunVerdict::Success(summary)) => {
                let _ = log_tx.send(TaskLogEvent::Summary {
                    code: CODE_DONE,
                    text: format!("task completed: {}", first_line(summary)),
                });
            }
            Ok(RunVerdict::Cancelled) => {
                let _ = log_tx.send(TaskLogEvent::Summary {
                    code: CODE_STATUS,
                    text: "task cancelled".to_string(),
                });
            }
            Ok(RunVerdict::Failure(report)) => {
                let _ = log_tx.send(TaskLogEvent::Summary {
                    code: CODE_FAIL,
                    text: format!("task failed: {}", report.error_message()),
                });
                for line in &report.debug_context {
                    let _ = log_tx.send(TaskLogEvent::Detailed(format!("context: {line}")));
                }
                for line in collect_environment(&self.binary_hint).await {
                    let _ = log_tx.send(TaskLogEvent::Detailed(format!("probe: {line}")));
                }
            }
            Err(e) => {
                let _ = log_tx.send(TaskLogEvent::Summary {
                    code: CODE_FAIL,
                    text: format!("internal error: {e}"),
                });
            }
        }

        drop(log_tx);
        match writer.await {
            Ok(logs) => {
                if let Err(e) = logs.close().await {
                    warn!("Task {task_id}: closing logs failed: {e}");
                }
            }
            Err(e) => warn!("Task {task_id}: log writer panicked: {e}"),
        }

        let verdict = outcome?;
        let outcome = match verdict {
            RunVerdict::Success(summary) => {
                let final_summary = if summary.trim().is_empty() {
                    "task completed".to_string()
                } else {
                    summary
                };
                self.store
                    .finalize(task_id, &TaskTermination::Completed { final_summary })
                    .await?;
                info!("Task {task_id} completed");
                TaskOutcome::Completed
            }
            RunVerdict::Failure(report) => {
                self.store
                    .finalize(
                        task_id,
                        &TaskTermination::Failed {
                            error_message: report.error_message(),
                        },
                    )
                    .await?;
                warn!("Task {task_id} failed: {}", report.error_message());
                TaskOutcome::Failed
            }
            RunVerdict::Cancelled => {
                self.store
                    .finalize(
                        task_id,
                        &TaskTermination::Cancelled {
                            reason: "cancelled by user".to_string(),
                        },
                    )
                    .await?;
                info!("Task {task_id} cancelled");
                TaskOutcome::Cancelled
            }
        };
        Ok(outcome)
    }

    async fn run_attempts(
        &self,
        task: &Task,
        log_tx: &mpsc::UnboundedSender<TaskLogEvent>,
        cancel: CancellationToken,
    ) -> Result<RunVerdict> {
        let budget = self.timeouts.for_tier(task.model_tier);

        let _ = log_tx.send(TaskLogEvent::Summary {
            code: CODE_HEADER,
            text: format!(
                "task {} started (tier {}, budget {}s, dir {}, pid {})",
                task.id,
                task.model_tier,
                budget.as_secs(),
                task.working_dir,
                std::process::id(),
            ),
        });
        let _ = log_tx.send(TaskLogEvent::Detailed(format!(
            "prompt preview: {}",
            first_line(&task.execution_prompt)
        )));

        let breaker = self.breakers.get(AGENT_BREAKER_KEY).await?;
        let controller = RetryController::new(RetryPolicy::from_config(&self.retry), breaker);

        // Per-attempt agent messages funnel into the single log writer.
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel::<AgentMessage>();
        let forward_tx = log_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = agent_rx.recv().await {
                let _ = forward_tx.send(TaskLogEvent::Agent(message));
            }
        });

        let request = AgentRequest {
            execution_prompt: task.execution_prompt.clone(),
            system_prompt: task.system_prompt.clone(),
            working_dir: task.working_dir.clone(),
        };

        let retry_log_tx = log_tx.clone();
        let run = controller.run(
            |attempt| {
                let agent = Arc::clone(&self.agent);
                let request = request.clone();
                let events = agent_tx.clone();
                let cancel = cancel.clone();
                async move {
                    debug!("Invoking agent (attempt {attempt})");
                    agent.invoke(request, events, cancel).await
                }
            },
            |attempt, report, delay| {
                let _ = retry_log_tx.send(TaskLogEvent::Summary {
                    code: CODE_RETRY,
                    text: format!(
                        "attempt {attempt} failed ({}); retrying in {:.1}s",
                        report.kind,
                        delay.as_secs_f64(),
                    ),
                });
                let _ = retry_log_tx.send(TaskLogEvent::Detailed(format!(
                    "retry {attempt}: {}",
                    serde_json::to_string(report).unwrap_or_else(|_| report.summary.clone()),
                )));
            },
        );

        let verdict = tokio::select! {
            _ = cancel.cancelled() => RunVerdict::Cancelled,
            result = tokio::time::timeout(budget, run) => match result {
                Err(_elapsed) => RunVerdict::Failure(classify(&AgentError::Timeout {
                    budget_secs: budget.as_secs(),
                })),
                Ok(Ok(summary)) => RunVerdict::Success(summary),
                Ok(Err(report)) => {
                    if cancel.is_cancelled() {
                        RunVerdict::Cancelled
                    } else {
                        RunVerdict::Failure(report)
                    }
                }
            },
        };

        drop(agent_tx);
        let _ = forwarder.await;
        Ok(verdict)
    }
}

enum RunVerdict {
    Success(String),
    Failure(FailureReport),
    Cancelled,
}

/// The single writer task owning a task's log pair.
///
/// Receives every event the executor and agent emit, appends them in
/// arrival order, and hands the pair back when the channel drains so the
/// executor can run the one-and-only close.
async fn log_writer(
    task_id: i64,
    mut logs: TaskLogs,
    store: Arc<Store>,
    mut rx: mpsc::UnboundedReceiver<TaskLogEvent>,
) -> TaskLogs {
    while let Some(event) = rx.recv().await {
        let result = match event {
            TaskLogEvent::Agent(message) => write_agent_message(task_id, &mut logs, &store, message).await,
            TaskLogEvent::Summary { code, text } => {
                let summary = logs.summary(code, &text).await;
                let cached = store.update_last_action(task_id, &text).await;
                summary.and(cached)
            }
            TaskLogEvent::Detailed(payload) => logs.detailed(&payload).await,
        };
        if let Err(e) = result {
            warn!("Task {task_id}: log write failed: {e}");
        }
    }
    logs
}

async fn write_agent_message(
    task_id: i64,
    logs: &mut TaskLogs,
    store: &Store,
    message: AgentMessage,
) -> Result<()> {
    let payload = serde_json::to_string(&message)?;
    logs.detailed(&payload).await?;

    if let AgentMessage::SessionStart { session_id } = &message {
        store.set_agent_session(task_id, session_id).await?;
    }
    if let Some(line) = message.action_line() {
        logs.summary(crate::logsink::CODE_TOOL, &line).await?;
        store.update_last_action(task_id, &line).await?;
    }
    Ok(())
}

fn first_line(text: &str) -> String {
    const MAX: usize = 200;
    let line = text.lines().next().unwrap_or_default();
    let mut out: String = line.chars().take(MAX).collect();
    if line.chars().count() > MAX {
        out.push('…');
    }
    out
}
