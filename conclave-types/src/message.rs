//! The tagged-union message protocol (`spec.md` §3).
//!
//! Every message carries `type`, `timestamp`, `agent_id`, and `session_id`
//! regardless of its variant; the variant-specific data is flattened onto the
//! same JSON object so the wire format matches `spec.md` §3 and §6 exactly
//! (`{"type": "agent", "timestamp": ..., "agent_id": ..., "session_id": ...,
//! "content": "...", "final": true}`).

use crate::ids::{AgentId, SessionId, ToolCallId};
use crate::tool::{ApprovalDecision, ToolErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// One item of a `ToolCall` batch, as carried on the wire (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub tool_id: ToolCallId,
    pub tool_name: String,
    pub tool_args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub timestamp: u64,
    pub agent_id: AgentId,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    User {
        content: String,
    },
    Agent {
        content: String,
        #[serde(rename = "final")]
        is_final: bool,
    },
    Thinking {
        content: String,
    },
    System {
        content: String,
    },
    ToolCall {
        tool_calls: Vec<ToolCallRequest>,
    },
    ApprovalRequest {
        tool_id: ToolCallId,
        tool_name: String,
        tool_args: Value,
    },
    ApprovalResponse {
        tool_id: ToolCallId,
        decision: ApprovalDecision,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
    ToolStarted {
        tool_id: ToolCallId,
        tool_name: String,
    },
    ToolResult {
        tool_id: ToolCallId,
        tool_name: String,
        result: Value,
    },
    ToolError {
        tool_id: ToolCallId,
        tool_name: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_type: Option<ToolErrorKind>,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

/// Milliseconds since the Unix epoch, used to stamp every outbound message.
pub fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl Message {
    pub fn new(agent_id: AgentId, session_id: SessionId, payload: MessagePayload) -> Self {
        Self {
            timestamp: now_timestamp(),
            agent_id,
            session_id,
            payload,
        }
    }

    pub fn is_final_agent_message(&self) -> bool {
        matches!(self.payload, MessagePayload::Agent { is_final: true, .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.payload,
            MessagePayload::Error { .. } | MessagePayload::ToolError { .. }
        )
    }
}
