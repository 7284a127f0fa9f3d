//! Process-wide supervisor of in-flight executors.
//!
//! Holds the concurrency bound, the per-task cancellation tokens, and the
//! startup recovery path. Executors run as tasks inside this process; the
//! isolation that matters is between an executor and the agent child it
//! spawns, and a crashing agent never takes the scheduler down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::executor::Executor;
use crate::logsink::LogSink;
use crate::models::{NewTask, Task, TaskOutcome, TaskStatus};
use crate::store::{Store, TaskTermination, TransitionPatch};
use crate::Result;

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SchedulerStats {
    pub running: usize,
    pub queued: usize,
    pub concurrency: usize,
}

pub struct Scheduler {
    store: Arc<Store>,
    sink: Arc<LogSink>,
    executor: Executor,
    permits: Arc<Semaphore>,
    concurrency: usize,
    cancellations: Mutex<HashMap<i64, CancellationToken>>,
    shutdown: CancellationToken,
    running: AtomicUsize,
    queued: AtomicUsize,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        sink: Arc<LogSink>,
        executor: Executor,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            sink,
            executor,
            permits: Arc::new(Semaphore::new(config.concurrency)),
            concurrency: config.concurrency,
            cancellations: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            running: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    /// Admit a single task: synchronous with respect to the row existing,
    /// asynchronous with respect to execution.
    pub async fn submit(self: &Arc<Self>, new: NewTask) -> Result<Task> {
        let task = self.store.create_task(&new).await?;
        info!("Task {} submitted", task.id);

        let scheduler = Arc::clone(self);
        let task_id = task.id;
        tokio::spawn(async move {
            if let Err(e) = scheduler.dispatch(task_id).await {
                error!("Dispatch of task {task_id} failed: {e}");
            }
        });
        Ok(task)
    }

    /// Run one task behind the concurrency bound and return its outcome.
    /// Used directly by the orchestrator for gated members.
    pub async fn dispatch(self: &Arc<Self>, task_id: i64) -> Result<TaskOutcome> {
        let token = self.cancellation_for(task_id).await;

        self.queued.fetch_add(1, Ordering::SeqCst);
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                permit.expect("scheduler semaphore is never closed")
            }
            _ = token.cancelled() => {
                // Cancelled while queued; the cancel path already
                // finalized the row.
                self.queued.fetch_sub(1, Ordering::SeqCst);
                self.release(task_id).await;
                return Ok(TaskOutcome::Cancelled);
            }
        };

        self.running.fetch_add(1, Ordering::SeqCst);
        let outcome = self.executor.execute(task_id, token).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        self.release(task_id).await;
        outcome
    }

    /// The cancellation token shared by everything supervising this task.
    /// Tokens are children of the shutdown token, so a service drain
    /// cancels every in-flight task in one step.
    pub async fn cancellation_for(&self, task_id: i64) -> CancellationToken {
        let mut cancellations = self.cancellations.lock().await;
        cancellations
            .entry(task_id)
            .or_insert_with(|| self.shutdown.child_token())
            .clone()
    }

    pub(crate) async fn release(&self, task_id: i64) {
        self.cancellations.lock().await.remove(&task_id);
    }

    /// Best-effort, idempotent cancel. Terminal tasks are a no-op; queued
    /// and waiting tasks are finalized here; a running task gets its
    /// signal and the executor finalizes it.
    pub async fn cancel(&self, task_id: i64) -> Result<TaskStatus> {
        let task = self.store.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(task.status);
        }

        if matches!(task.status, TaskStatus::Pending | TaskStatus::Waiting) {
            self.store
                .finalize(
                    task_id,
                    &TaskTermination::Cancelled {
                        reason: "cancelled by user".to_string(),
                    },
                )
                .await?;
        }

        if let Some(token) = self.cancellations.lock().await.get(&task_id) {
            token.cancel();
        }

        Ok(self.store.get_task(task_id).await?.status)
    }

    /// Re-queue rows a previous process left behind. Orchestrated members
    /// are recovered by the orchestrator; this handles direct submissions.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let leftover = self.store.load_pending_on_startup().await?;
        let mut requeued = 0;
        for task in leftover
            .into_iter()
            .filter(|t| t.orchestration_id.is_none())
        {
            self.requeue(&task).await?;
            requeued += 1;
        }
        if requeued > 0 {
            info!("Requeued {requeued} tasks from a previous run");
        }
        Ok(requeued)
    }

    /// Mark a row the previous process left in `running`: append a
    /// recovery marker to its logs and put it back in `pending`.
    pub(crate) async fn mark_recovered(&self, task: &Task) -> Result<()> {
        warn!(
            "Task {} was running when the previous process died; requeueing",
            task.id
        );
        self.sink
            .append_recovery_marker(
                task,
                "requeued after service restart; previous run was interrupted",
            )
            .await?;
        self.store
            .transition(
                task.id,
                TaskStatus::Running,
                TaskStatus::Pending,
                TransitionPatch::default(),
            )
            .await
    }

    /// Put one leftover row back on the queue.
    pub(crate) async fn requeue(self: &Arc<Self>, task: &Task) -> Result<()> {
        if task.status == TaskStatus::Running {
            self.mark_recovered(task).await?;
        }

        let scheduler = Arc::clone(self);
        let task_id = task.id;
        tokio::spawn(async move {
            if let Err(e) = scheduler.dispatch(task_id).await {
                error!("Recovery dispatch of task {task_id} failed: {e}");
            }
        });
        Ok(())
    }

    /// Drain the service: every in-flight and queued task receives a
    /// cancellation signal through its child token.
    pub fn shutdown(&self) {
        info!("Scheduler shutting down; signalling in-flight executors");
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.running.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            concurrency: self.concurrency,
        }
    }
}
