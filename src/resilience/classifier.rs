//! Agent failure classification.
//!
//! Maps an [`AgentError`] to a closed kind set and decides transient vs
//! permanent. `classify` is a pure function of its input so it can be
//! unit-tested against synthetic failures; the environmental probe in
//! [`crate::agent::collect_environment`] is attached by the executor
//! afterwards and never influences the verdict here.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::agent::AgentError;

/// Closed set of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Agent binary not found in PATH.
    AgentMissing,
    /// Spawn succeeded but IPC with the agent failed.
    AgentConnect,
    /// Agent emitted a message we cannot parse structurally.
    AgentProtocol,
    /// JSON framing error from the agent stream.
    AgentJson,
    /// Agent process exited non-zero.
    AgentProcess,
    /// Explicit rate limiting; forces a long fixed retry delay.
    RateLimit,
    /// Our per-task timeout budget elapsed.
    InternalTimeout,
    /// Call suppressed because the circuit breaker is open.
    BreakerOpen,
    /// Any other agent-reported error.
    AgentGeneric,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AgentMissing => "agent_missing",
            Self::AgentConnect => "agent_connect",
            Self::AgentProtocol => "agent_protocol",
            Self::AgentJson => "agent_json",
            Self::AgentProcess => "agent_process",
            Self::RateLimit => "rate_limit",
            Self::InternalTimeout => "internal_timeout",
            Self::BreakerOpen => "breaker_open",
            Self::AgentGeneric => "agent_generic",
        };
        f.write_str(s)
    }
}

/// Classification verdict plus the evidence that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub transient: bool,
    pub http_status: u16,
    /// One-line human description of what happened.
    pub summary: String,
    pub recovery_hint: String,
    /// Raw evidence: stderr tail, offending line, probe output. Purely
    /// descriptive; nothing reads this to make decisions.
    pub debug_context: Vec<String>,
}

impl FailureReport {
    /// The user-visible `error_message` format for a finalized task:
    /// `[{kind}] {one-line description} | hint: {recovery_hint}`.
    pub fn error_message(&self) -> String {
        format!(
            "[{}] {} | hint: {}",
            self.kind, self.summary, self.recovery_hint
        )
    }

    /// Report for a call suppressed by an open breaker. Not produced by
    /// `classify`: no agent ran, so there is nothing to classify.
    pub fn breaker_open(key: &str) -> Self {
        Self {
            kind: FailureKind::BreakerOpen,
            transient: false,
            http_status: 503,
            summary: format!("circuit breaker '{key}' is open; call suppressed"),
            recovery_hint: "wait for the breaker cooldown to elapse, then resubmit".to_string(),
            debug_context: Vec::new(),
        }
    }
}

/// Exit codes conventionally meaning the process was stopped from outside
/// rather than failing on its own: timeout(1), SIGKILL, SIGTERM.
const INTERRUPTED_EXIT_CODES: [i32; 3] = [124, 137, 143];

fn network_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(network|connection|connect|timed?\s*out|timeout|temporarily unavailable|service unavailable|overloaded|50[239])",
        )
        .expect("network pattern is valid")
    })
}

fn rate_limit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(rate[\s_-]?limit|\b429\b)").expect("rate-limit pattern is valid"))
}

/// Classify one attempt failure. Pure: equal inputs yield equal reports.
pub fn classify(error: &AgentError) -> FailureReport {
    match error {
        AgentError::BinaryMissing { searched } => FailureReport {
            kind: FailureKind::AgentMissing,
            transient: false,
            http_status: 503,
            summary: "agent binary not found".to_string(),
            recovery_hint: "install the agent CLI and make sure it is on PATH".to_string(),
            debug_context: vec![format!("searched: {}", searched.join(", "))],
        },

        AgentError::Stream { message } => FailureReport {
            kind: FailureKind::AgentConnect,
            transient: true,
            http_status: 502,
            summary: format!("agent IPC failed: {message}"),
            recovery_hint: "transient process plumbing failure; retried automatically".to_string(),
            debug_context: Vec::new(),
        },

        AgentError::Protocol { line } => FailureReport {
            kind: FailureKind::AgentProtocol,
            transient: false,
            http_status: 502,
            summary: "agent emitted a structurally unknown message".to_string(),
            recovery_hint: "agent and service versions likely disagree; upgrade the agent"
                .to_string(),
            debug_context: vec![format!("offending line: {line}")],
        },

        AgentError::Json { line, error } => {
            let truncated = looks_truncated(line, error);
            FailureReport {
                kind: FailureKind::AgentJson,
                transient: truncated,
                http_status: 502,
                summary: if truncated {
                    "agent stream ended mid-message".to_string()
                } else {
                    format!("agent emitted invalid JSON: {error}")
                },
                recovery_hint: if truncated {
                    "truncated fragment; retried automatically".to_string()
                } else {
                    "agent produced malformed output; check the detailed log".to_string()
                },
                debug_context: vec![format!("offending line: {line}"), format!("decode error: {error}")],
            }
        }

        AgentError::Exit { code, stderr_tail } => {
            let stderr_text = stderr_tail.join("\n");
            if rate_limit_regex().is_match(&stderr_text) {
                return rate_limited(&stderr_text, stderr_tail);
            }
            let interrupted =
                code.map_or(true, |c| INTERRUPTED_EXIT_CODES.contains(&c));
            let networky = network_regex().is_match(&stderr_text);
            FailureReport {
                kind: FailureKind::AgentProcess,
                transient: interrupted || networky,
                http_status: 500,
                summary: match code {
                    Some(code) => format!("agent exited with code {code}"),
                    None => "agent was killed by a signal".to_string(),
                },
                recovery_hint: if interrupted || networky {
                    "environmental interruption; retried automatically".to_string()
                } else {
                    "inspect the stderr tail in the detailed log".to_string()
                },
                debug_context: stderr_tail.clone(),
            }
        }

        AgentError::Reported { message } => {
            if rate_limit_regex().is_match(message) {
                return rate_limited(message, &[message.clone()]);
            }
            FailureReport {
                kind: FailureKind::AgentGeneric,
                transient: false,
                http_status: 500,
                summary: first_line(message),
                recovery_hint: "the agent declined the task; revise the prompt".to_string(),
                debug_context: vec![message.clone()],
            }
        }

        AgentError::Timeout { budget_secs } => FailureReport {
            kind: FailureKind::InternalTimeout,
            transient: true,
            http_status: 504,
            summary: format!("task exceeded its {budget_secs}s timeout budget"),
            recovery_hint: "resubmit with a deeper model tier for a larger budget".to_string(),
            debug_context: Vec::new(),
        },

        // Cancellation is terminal by decree, never retried; the executor
        // normally handles it before classification ever runs.
        AgentError::Cancelled => FailureReport {
            kind: FailureKind::AgentGeneric,
            transient: false,
            http_status: 499,
            summary: "invocation cancelled".to_string(),
            recovery_hint: "resubmit the task if the cancel was accidental".to_string(),
            debug_context: Vec::new(),
        },
    }
}

fn rate_limited(text: &str, context: &[String]) -> FailureReport {
    FailureReport {
        kind: FailureKind::RateLimit,
        transient: true,
        http_status: 429,
        summary: first_line(text),
        recovery_hint: "provider rate limit; waiting a fixed delay before retry".to_string(),
        debug_context: context.to_vec(),
    }
}

/// Heuristic for a JSON fragment cut off mid-stream, as opposed to output
/// that was never JSON: the decoder hit end-of-input, or the line does not
/// even close its outermost value.
fn looks_truncated(line: &str, error: &str) -> bool {
    let trimmed = line.trim_end();
    error.contains("EOF") || !(trimmed.ends_with('}') || trimmed.ends_with(']'))
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("unknown error").to_string()
}
