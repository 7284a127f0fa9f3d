//! External agent integration.
//!
//! The agent is a command-line coding assistant spawned once per execution
//! attempt. This module owns binary discovery, argv construction, the
//! streaming NDJSON decode into [`AgentMessage`], and the environmental
//! diagnostics attached to failures. Everything task-lifecycle-shaped lives
//! in the executor; everything agent-process-shaped lives here.

mod client;
mod command_builder;
mod diagnostics;

pub use client::{AgentClient, AgentRequest, CliAgentClient};
pub use command_builder::{AgentCommandBuilder, PermissionMode};
pub use diagnostics::collect_environment;

#[cfg(test)]
pub(crate) mod testing;

use crate::models::AgentMessage;

/// Failure raised by one agent invocation attempt, before classification.
///
/// Input type of [`crate::resilience::classify`]: it carries the raw
/// evidence (exit code, stderr tail, offending line) and no policy
/// decisions.
#[derive(Debug, Clone)]
pub enum AgentError {
    /// The agent binary was not found at any probed location.
    BinaryMissing { searched: Vec<String> },
    /// Spawn succeeded but talking to the child failed (stdin/stdout IPC).
    Stream { message: String },
    /// A line parsed as JSON but not as any known message structure.
    Protocol { line: String },
    /// A line failed JSON framing entirely.
    Json { line: String, error: String },
    /// The agent exited non-zero.
    Exit {
        code: Option<i32>,
        stderr_tail: Vec<String>,
    },
    /// The agent itself reported a failed run in its final message.
    Reported { message: String },
    /// Our per-task deadline elapsed (raised by the executor).
    Timeout { budget_secs: u64 },
    /// The invocation was cancelled; never classified as a failure.
    Cancelled,
}

/// Decode one NDJSON line from the agent into zero or more messages.
///
/// The agent's wire format is not part of this crate's contract, so the
/// decoder is tolerant: well-formed objects with an unknown `type` are
/// ignored, objects without a `type` are a protocol error, and broken JSON
/// framing is reported separately so the classifier can tell a truncated
/// fragment from garbage.
pub fn decode_line(line: &str) -> Result<Vec<AgentMessage>, AgentError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let value: serde_json::Value =
        serde_json::from_str(trimmed).map_err(|e| AgentError::Json {
            line: trimmed.to_string(),
            error: e.to_string(),
        })?;

    let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
        return Err(AgentError::Protocol {
            line: trimmed.to_string(),
        });
    };

    let mut messages = Vec::new();
    match kind {
        "system" => {
            if let Some(session_id) = value.get("session_id").and_then(|s| s.as_str()) {
                messages.push(AgentMessage::SessionStart {
                    session_id: session_id.to_string(),
                });
            }
        }
        "assistant" | "user" => {
            let content = value
                .pointer("/message/content")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            for block in content {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        let text = block
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .to_string();
                        messages.push(if kind == "assistant" {
                            AgentMessage::AssistantText { text }
                        } else {
                            AgentMessage::UserText { text }
                        });
                    }
                    Some("tool_use") => {
                        messages.push(AgentMessage::ToolUse {
                            name: block
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or("unknown")
                                .to_string(),
                            input: block.get("input").cloned().unwrap_or(serde_json::Value::Null),
                        });
                    }
                    Some("tool_result") => {
                        messages.push(AgentMessage::ToolResult {
                            content: block
                                .get("content")
                                .cloned()
                                .unwrap_or(serde_json::Value::Null),
                            is_error: block
                                .get("is_error")
                                .and_then(|b| b.as_bool())
                                .unwrap_or(false),
                        });
                    }
                    // Unknown block kinds inside a known envelope are
                    // agent-internal detail.
                    _ => {}
                }
            }
        }
        "result" => {
            messages.push(AgentMessage::Final {
                summary: value
                    .get("result")
                    .and_then(|r| r.as_str())
                    .unwrap_or_default()
                    .to_string(),
                is_error: value
                    .get("is_error")
                    .and_then(|b| b.as_bool())
                    .unwrap_or(false),
            });
        }
        // Forward compatibility: typed envelopes we do not know yet are
        // skipped, not failed.
        _ => {}
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_session_start() {
        let msgs =
            decode_line(r#"{"type":"system","subtype":"init","session_id":"abc-123"}"#).unwrap();
        assert!(matches!(
            &msgs[..],
            [AgentMessage::SessionStart { session_id }] if session_id == "abc-123"
        ));
    }

    #[test]
    fn decodes_tool_use_inside_assistant_envelope() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"on it"},
            {"type":"tool_use","name":"Bash","input":{"command":"ls"}}
        ]}}"#;
        let msgs = decode_line(line).unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(&msgs[0], AgentMessage::AssistantText { text } if text == "on it"));
        assert!(matches!(&msgs[1], AgentMessage::ToolUse { name, .. } if name == "Bash"));
    }

    #[test]
    fn tool_result_error_flag_is_data_not_failure() {
        let line = r#"{"type":"user","message":{"content":[
            {"type":"tool_result","content":"exit status 1","is_error":true}
        ]}}"#;
        let msgs = decode_line(line).unwrap();
        assert!(matches!(
            &msgs[..],
            [AgentMessage::ToolResult { is_error: true, .. }]
        ));
    }

    #[test]
    fn decodes_final_result() {
        let msgs = decode_line(r#"{"type":"result","subtype":"success","result":"all done","is_error":false}"#)
            .unwrap();
        assert!(matches!(
            &msgs[..],
            [AgentMessage::Final { summary, is_error: false }] if summary == "all done"
        ));
    }

    #[test]
    fn unknown_envelope_type_is_skipped() {
        assert!(decode_line(r#"{"type":"telemetry","x":1}"#).unwrap().is_empty());
    }

    #[test]
    fn missing_type_is_a_protocol_error() {
        assert!(matches!(
            decode_line(r#"{"payload":"?"}"#),
            Err(AgentError::Protocol { .. })
        ));
    }

    #[test]
    fn broken_framing_is_a_json_error() {
        assert!(matches!(
            decode_line(r#"{"type":"result","result":"trunc"#),
            Err(AgentError::Json { .. })
        ));
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert!(decode_line("   ").unwrap().is_empty());
    }
}
