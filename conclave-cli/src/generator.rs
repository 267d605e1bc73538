//! A rule-based stand-in for the language-model client (`spec.md` §4.7's
//! `Generator`). Real embedders plug in an HTTP client to an actual model;
//! this one recognises two fixed intents ("what time is it" and "echo ...")
//! so the terminal session has something to exercise the tool flow against.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use conclave_core::interfaces::{Generator, GeneratorError};
use conclave_types::message::ToolCallRequest;
use conclave_types::{AgentId, Message, MessagePayload, SessionId, ToolCall, ToolCallId, ToolResult};

pub struct TerminalGenerator {
    next_call_id: AtomicU64,
}

impl TerminalGenerator {
    pub fn new() -> Self {
        Self { next_call_id: AtomicU64::new(1) }
    }

    fn emit(&self, payload: MessagePayload) -> Message {
        Message::new(AgentId::new("__generator__"), SessionId::new("__generator__"), payload)
    }
}

impl Default for TerminalGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for TerminalGenerator {
    async fn stream(
        &self,
        messages: &[Message],
        tools: &[String],
        _prev_tool_calls: Option<&[ToolCall]>,
        prev_tool_results: Option<&[ToolResult]>,
    ) -> Result<Vec<Message>, GeneratorError> {
        if let Some(results) = prev_tool_results {
            let summary = results
                .iter()
                .map(|r| format!("{} -> {}", r.tool_name, r.content))
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(vec![self.emit(MessagePayload::Agent {
                content: format!("Here's what I found: {summary}"),
                is_final: false,
            })]);
        }

        let last_user = messages
            .iter()
            .rev()
            .find_map(|m| match &m.payload {
                MessagePayload::User { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_default();

        if last_user.to_lowercase().contains("time") && tools.iter().any(|t| t == "current_time") {
            let call_id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
            return Ok(vec![self.emit(MessagePayload::ToolCall {
                tool_calls: vec![ToolCallRequest {
                    tool_id: ToolCallId::new(format!("call-{call_id}")),
                    tool_name: "current_time".to_string(),
                    tool_args: serde_json::json!({}),
                }],
            })]);
        }

        Ok(vec![self.emit(MessagePayload::Agent {
            content: format!("You said: {last_user}"),
            is_final: false,
        })])
    }
}
