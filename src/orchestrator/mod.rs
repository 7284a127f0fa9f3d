//! DAG runner.
//!
//! Admits batches of tasks with declared dependencies, gates each member on
//! its predecessors' one-shot completion events, and propagates skips down
//! the graph. The wait is purely event-driven: nothing here polls the task
//! table, and tasks never hold a pointer back to the orchestrator.
//! Completion flows through `watch` channels fired exactly once.

pub mod dag;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::models::{Orchestration, Task, TaskOutcome, TaskSpec, TaskStatus};
use crate::scheduler::Scheduler;
use crate::store::{Store, TaskTermination, TransitionPatch};
use crate::Result;

type CompletionSender = watch::Sender<Option<TaskOutcome>>;
type CompletionReceiver = watch::Receiver<Option<TaskOutcome>>;

pub struct Orchestrator {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Admit a batch. All-or-nothing: the store validates the DAG and
    /// inserts every member atomically; only then are the gates armed.
    pub async fn submit_group(&self, specs: Vec<TaskSpec>) -> Result<Orchestration> {
        let (orch, tasks) = self.store.create_orchestration(&specs).await?;
        info!(
            "Orchestration {} admitted with {} tasks",
            orch.id, orch.total_tasks
        );
        self.arm(orch.id, tasks, &HashMap::new()).await;
        Ok(orch)
    }

    /// Cancel every non-terminal member, best-effort and idempotent. The
    /// aggregate is pinned to `cancelled` regardless of member outcomes.
    pub async fn cancel(&self, orch_id: i64) -> Result<Orchestration> {
        self.store.mark_orchestration_cancelled(orch_id).await?;
        let members = self.store.orchestration_members(orch_id).await?;
        for member in members.iter().filter(|t| !t.status.is_terminal()) {
            self.scheduler.cancel(member.id).await?;
        }
        info!("Orchestration {orch_id} cancelled");
        self.store.get_orchestration(orch_id).await
    }

    /// Re-arm orchestrations a previous process left open. Terminal
    /// members fire their events immediately so surviving waiters see
    /// history; `running` members are marked and requeued.
    pub async fn recover(&self) -> Result<usize> {
        let open = self.store.load_open_orchestrations().await?;
        let count = open.len();
        for orch in open {
            let members = self.store.orchestration_members(orch.id).await?;

            let mut fired = HashMap::new();
            for member in &members {
                if let (Some(identifier), Some(outcome)) =
                    (member.task_identifier.clone(), outcome_of(member.status))
                {
                    fired.insert(identifier, outcome);
                }
            }

            let live: Vec<Task> = members
                .into_iter()
                .filter(|t| !t.status.is_terminal())
                .collect();
            // Members the dead process left in `running` go back to
            // `pending` (with a recovery marker) before their gates arm.
            for member in live.iter().filter(|t| t.status == TaskStatus::Running) {
                if let Err(e) = self.scheduler.mark_recovered(member).await {
                    error!("Failed to requeue member {}: {e}", member.id);
                }
            }
            info!(
                "Re-arming orchestration {} ({} live members)",
                orch.id,
                live.len()
            );
            self.arm(orch.id, live, &fired).await;
            self.store.recompute_orchestration(orch.id).await?;
        }
        Ok(count)
    }

    /// Arm one completion event per member and spawn the gates.
    /// `already_fired` carries outcomes from a previous run during
    /// recovery; on fresh admission it is empty.
    async fn arm(
        &self,
        orch_id: i64,
        tasks: Vec<Task>,
        already_fired: &HashMap<String, TaskOutcome>,
    ) {
        let mut senders: HashMap<String, CompletionSender> = HashMap::new();
        let mut receivers: HashMap<String, CompletionReceiver> = HashMap::new();
        let identifiers: Vec<String> = tasks
            .iter()
            .filter_map(|t| t.task_identifier.clone())
            .chain(already_fired.keys().cloned())
            .collect();
        for identifier in identifiers {
            if receivers.contains_key(&identifier) {
                continue;
            }
            let initial = already_fired.get(&identifier).copied();
            let (tx, rx) = watch::channel(initial);
            senders.insert(identifier.clone(), tx);
            receivers.insert(identifier, rx);
        }

        for task in tasks {
            let Some(identifier) = task.task_identifier.clone() else {
                continue;
            };
            let Some(own_event) = senders.remove(&identifier) else {
                continue;
            };
            let dep_events: Vec<(String, CompletionReceiver)> = task
                .depends_on
                .iter()
                .filter_map(|dep| receivers.get(dep).map(|rx| (dep.clone(), rx.clone())))
                .collect();

            let gate = Gate {
                store: Arc::clone(&self.store),
                scheduler: Arc::clone(&self.scheduler),
                orch_id,
                task,
                own_event,
                dep_events,
            };
            tokio::spawn(gate.run());
        }
    }
}

/// One cooperative unit guarding one orchestrated task.
struct Gate {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    orch_id: i64,
    task: Task,
    own_event: CompletionSender,
    dep_events: Vec<(String, CompletionReceiver)>,
}

impl Gate {
    async fn run(self) {
        let outcome = self.watch_and_dispatch().await;
        // Fire the one-shot completion event, then fold the outcome into
        // the aggregate. Order matters: successors may observe the event
        // before the aggregate row updates, never the other way around.
        let _ = self.own_event.send_replace(Some(outcome));
        if let Err(e) = self.store.recompute_orchestration(self.orch_id).await {
            error!(
                "Failed to recompute orchestration {}: {e}",
                self.orch_id
            );
        }
        self.scheduler.release(self.task.id).await;
    }

    async fn watch_and_dispatch(&self) -> TaskOutcome {
        let task_id = self.task.id;
        let cancel = self.scheduler.cancellation_for(task_id).await;

        // Dependency wait: event-driven only. A dependency that ended
        // anything but completed short-circuits into a skip.
        for (name, rx) in &self.dep_events {
            let mut rx = rx.clone();
            let fired = tokio::select! {
                _ = cancel.cancelled() => return self.cancelled().await,
                fired = wait_fired(&mut rx) => fired,
            };
            if fired != TaskOutcome::Completed {
                return self.skip(name, fired).await;
            }
        }

        if self.task.wait_after_dependencies > 0.0 {
            debug!(
                "Task {task_id}: dependencies satisfied, waiting {:.1}s",
                self.task.wait_after_dependencies
            );
            tokio::select! {
                _ = cancel.cancelled() => return self.cancelled().await,
                _ = tokio::time::sleep(Duration::from_secs_f64(self.task.wait_after_dependencies)) => {}
            }
        }

        // Members with dependencies sat in `waiting`; promote before
        // dispatch. Roots were inserted directly in `pending`, and
        // recovered members may already be back there.
        if !self.task.depends_on.is_empty() {
            if let Err(e) = self
                .store
                .transition(
                    task_id,
                    TaskStatus::Waiting,
                    TaskStatus::Pending,
                    TransitionPatch::default(),
                )
                .await
            {
                let current = self.store.get_task(task_id).await.map(|t| t.status);
                if !matches!(current, Ok(TaskStatus::Pending)) {
                    debug!("Task {task_id}: not promotable ({e}); assuming cancelled");
                    return self.cancelled().await;
                }
            }
        }

        match self.scheduler.dispatch(task_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Task {task_id}: dispatch failed: {e}");
                let _ = self
                    .store
                    .finalize(
                        task_id,
                        &TaskTermination::Failed {
                            error_message: format!(
                                "[agent_generic] internal dispatch failure: {e} | hint: check the service log"
                            ),
                        },
                    )
                    .await;
                TaskOutcome::Failed
            }
        }
    }

    /// Dependency ended non-completed: no executor is launched; the task
    /// goes straight to `skipped` and the skip cascades through its own
    /// event.
    async fn skip(&self, dep: &str, dep_outcome: TaskOutcome) -> TaskOutcome {
        info!(
            "Task {}: skipped, dependency '{dep}' ended {dep_outcome}",
            self.task.id
        );
        let _ = self
            .store
            .finalize(
                self.task.id,
                &TaskTermination::Skipped {
                    reason: format!("dependency '{dep}' ended {dep_outcome}"),
                },
            )
            .await;
        TaskOutcome::Skipped
    }

    async fn cancelled(&self) -> TaskOutcome {
        // The cancel path already finalized the row; this only shapes the
        // event for successors.
        let _ = self
            .store
            .finalize(
                self.task.id,
                &TaskTermination::Cancelled {
                    reason: "cancelled by user".to_string(),
                },
            )
            .await;
        TaskOutcome::Cancelled
    }
}

/// Block until a completion event fires. A sender dropped without firing
/// means its gate died; report failure so waiters release instead of
/// hanging forever.
async fn wait_fired(rx: &mut CompletionReceiver) -> TaskOutcome {
    loop {
        if let Some(outcome) = *rx.borrow_and_update() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return TaskOutcome::Failed;
        }
    }
}

fn outcome_of(status: TaskStatus) -> Option<TaskOutcome> {
    match status {
        TaskStatus::Completed => Some(TaskOutcome::Completed),
        TaskStatus::Failed => Some(TaskOutcome::Failed),
        TaskStatus::Skipped => Some(TaskOutcome::Skipped),
        TaskStatus::Cancelled => Some(TaskOutcome::Cancelled),
        TaskStatus::Pending | TaskStatus::Waiting | TaskStatus::Running => None,
    }
}
