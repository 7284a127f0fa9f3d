use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{decode_line, AgentCommandBuilder, AgentError};
use crate::config::AgentConfig;
use crate::constants::STDERR_TAIL_LINES;
use crate::models::AgentMessage;

/// One agent invocation: the prompts and where to run them.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub execution_prompt: String,
    pub system_prompt: Option<String>,
    pub working_dir: String,
}

/// Seam between the executor and the external agent.
///
/// The executor drives every attempt through this trait; tests substitute
/// a scripted implementation so the full lifecycle runs without a real
/// agent binary on the machine.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Run the agent once. Streamed messages go out over `events` as they
    /// arrive; the returned string is the agent's final textual summary.
    async fn invoke(
        &self,
        request: AgentRequest,
        events: mpsc::UnboundedSender<AgentMessage>,
        cancel: CancellationToken,
    ) -> Result<String, AgentError>;
}

/// Production client: spawns the agent CLI per attempt and consumes its
/// stream-json stdout.
pub struct CliAgentClient {
    config: AgentConfig,
    // Discovery result cached across invocations; probing involves running
    // the binary, which is too slow to repeat per attempt.
    resolved_binary: RwLock<Option<String>>,
}

impl CliAgentClient {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            resolved_binary: RwLock::new(None),
        }
    }

    /// Candidate locations, most specific first. An explicit configuration
    /// short-circuits the probe entirely.
    fn candidates(&self) -> Vec<String> {
        if let Some(path) = &self.config.binary_path {
            return vec![path.clone()];
        }
        let mut paths = vec![
            "claude".to_string(),
            "/usr/local/bin/claude".to_string(),
        ];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".local/bin/claude").to_string_lossy().into_owned());
        }
        paths
    }

    /// Locate a working agent binary, probing each candidate with
    /// `--version`. Resolution is lazy so the service can boot (and accept
    /// submissions) on a machine where the agent is installed later.
    async fn resolve_binary(&self) -> Result<String, AgentError> {
        if let Some(found) = self.resolved_binary.read().await.clone() {
            return Ok(found);
        }

        let candidates = self.candidates();
        for candidate in &candidates {
            match tokio::process::Command::new(candidate)
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
            {
                Ok(status) if status.success() => {
                    info!("Found agent binary at: {candidate}");
                    *self.resolved_binary.write().await = Some(candidate.clone());
                    return Ok(candidate.clone());
                }
                Ok(_) => debug!("Binary at {candidate} exists but --version failed"),
                Err(_) => debug!("No binary found at {candidate}"),
            }
        }

        Err(AgentError::BinaryMissing {
            searched: candidates,
        })
    }
}

#[async_trait]
impl AgentClient for CliAgentClient {
    async fn invoke(
        &self,
        request: AgentRequest,
        events: mpsc::UnboundedSender<AgentMessage>,
        cancel: CancellationToken,
    ) -> Result<String, AgentError> {
        let binary = self.resolve_binary().await?;

        let mut builder =
            AgentCommandBuilder::new(binary.as_str()).with_working_dir(&request.working_dir);
        if let Some(system_prompt) = &request.system_prompt {
            builder = builder.with_system_prompt(system_prompt.as_str());
        }

        let mut command = builder.build();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::BinaryMissing {
                    searched: vec![binary.clone()],
                }
            } else {
                AgentError::Stream {
                    message: format!("failed to spawn agent: {e}"),
                }
            }
        })?;

        // The execution prompt goes over stdin, never onto the argv, so a
        // hostile prompt cannot grow extra flags.
        let mut stdin = child.stdin.take().ok_or_else(|| AgentError::Stream {
            message: "agent stdin not piped".to_string(),
        })?;
        stdin
            .write_all(request.execution_prompt.as_bytes())
            .await
            .map_err(|e| AgentError::Stream {
                message: format!("failed to write prompt to agent stdin: {e}"),
            })?;
        drop(stdin);

        // Keep the last few stderr lines for the classifier; the full
        // stream is the agent's own noise.
        let stderr = child.stderr.take().ok_or_else(|| AgentError::Stream {
            message: "agent stderr not piped".to_string(),
        })?;
        let stderr_task = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>()
        });

        let stdout = child.stdout.take().ok_or_else(|| AgentError::Stream {
            message: "agent stdout not piped".to_string(),
        })?;
        let mut lines = BufReader::new(stdout).lines();
        let mut final_message: Option<(String, bool)> = None;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    return Err(AgentError::Cancelled);
                }
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    for message in decode_line(&line)? {
                        if let AgentMessage::Final { summary, is_error } = &message {
                            final_message = Some((summary.clone(), *is_error));
                        }
                        // A closed receiver means the executor is gone;
                        // the child's exit status still decides the outcome.
                        let _ = events.send(message);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = child.start_kill();
                    return Err(AgentError::Stream {
                        message: format!("failed reading agent stdout: {e}"),
                    });
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                return Err(AgentError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| AgentError::Stream {
                message: format!("failed waiting for agent exit: {e}"),
            })?,
        };
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            warn!("Agent process exited non-zero: {status:?}");
            return Err(AgentError::Exit {
                code: status.code(),
                stderr_tail,
            });
        }

        match final_message {
            Some((summary, false)) => Ok(summary),
            Some((summary, true)) => Err(AgentError::Reported { message: summary }),
            None => Err(AgentError::Protocol {
                line: "stream ended without a final result message".to_string(),
            }),
        }
    }
}
