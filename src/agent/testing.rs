//! Scripted agent double for lifecycle tests.
//!
//! Provides controlled behavior without an agent binary on the machine:
//! each invocation pops the next scripted attempt, streams its messages,
//! and resolves to its outcome.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AgentClient, AgentError, AgentRequest};
use crate::models::AgentMessage;

/// One scripted attempt: messages to stream, then an outcome.
#[derive(Clone)]
pub struct ScriptedAttempt {
    pub messages: Vec<AgentMessage>,
    pub outcome: Result<String, AgentError>,
    /// Artificial run time, so tests can hold executors in-flight.
    pub delay: Duration,
}

impl ScriptedAttempt {
    pub fn success(summary: &str) -> Self {
        Self {
            messages: vec![
                AgentMessage::SessionStart {
                    session_id: "scripted-session".to_string(),
                },
                AgentMessage::ToolUse {
                    name: "Write".to_string(),
                    input: serde_json::json!({"file_path": "/tmp/out.txt"}),
                },
            ],
            outcome: Ok(summary.to_string()),
            delay: Duration::ZERO,
        }
    }

    pub fn failure(error: AgentError) -> Self {
        Self {
            messages: Vec::new(),
            outcome: Err(error),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
pub struct ScriptedAgent {
    attempts: Mutex<VecDeque<ScriptedAttempt>>,
    invocations: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(attempts: Vec<ScriptedAttempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into()),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Agent that succeeds on every invocation with the same summary.
    pub fn always_succeeding(summary: &str) -> Self {
        let agent = Self::default();
        agent.refill_with(summary);
        agent
    }

    fn refill_with(&self, summary: &str) {
        let mut attempts = self.attempts.lock().unwrap();
        for _ in 0..64 {
            attempts.push_back(ScriptedAttempt::success(summary));
        }
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn invoke(
        &self,
        _request: AgentRequest,
        events: mpsc::UnboundedSender<AgentMessage>,
        cancel: CancellationToken,
    ) -> Result<String, AgentError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let attempt = self
            .attempts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedAttempt::success("default scripted summary"));

        for message in attempt.messages {
            let _ = events.send(message);
        }
        if !attempt.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(attempt.delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        attempt.outcome
    }
}
