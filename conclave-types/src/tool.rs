//! Tool call/result data model (`spec.md` §3).

use crate::ids::ToolCallId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tool invocation requested by the generator within one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<ToolCallId>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Why a `ToolResult` represents a failure, per `spec.md` §3 and §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    ExecutionError,
    InvalidArgs,
    UserRejected,
    Timeout,
    /// Internal-only: an illegal `ToolTracker` stage transition was requested.
    /// Never serialized onto the client-facing wire; used only as a `Result::Err`
    /// payload inside `conclave-core` (see SPEC_FULL.md §7).
    ProtocolViolation,
}

/// The outcome of executing (or rejecting) one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub content: Value,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ToolErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_display: Option<String>,
}

impl ToolResult {
    pub fn success(tool_call_id: ToolCallId, tool_name: impl Into<String>, content: Value) -> Self {
        Self {
            tool_call_id,
            tool_name: tool_name.into(),
            content,
            is_error: false,
            error: None,
            error_type: None,
            user_display: None,
        }
    }

    pub fn failure(
        tool_call_id: ToolCallId,
        tool_name: impl Into<String>,
        error: impl Into<String>,
        error_type: ToolErrorKind,
    ) -> Self {
        Self {
            tool_call_id,
            tool_name: tool_name.into(),
            content: Value::Null,
            is_error: true,
            error: Some(error.into()),
            error_type: Some(error_type),
            user_display: None,
        }
    }

    pub fn with_user_display(mut self, display: impl Into<String>) -> Self {
        self.user_display = Some(display.into());
        self
    }
}

/// The decision a user makes on a pending approval (`spec.md` §3's
/// `ApprovalResponse.decision`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_error_round_trips() {
        let result = ToolResult::failure(
            ToolCallId::new("1"),
            "write_file",
            "no",
            ToolErrorKind::UserRejected,
        )
        .with_user_display("no");
        let json = serde_json::to_string(&result).unwrap();
        let back: ToolResult = serde_json::from_str(&json).unwrap();
        assert!(back.is_error);
        assert_eq!(back.error_type, Some(ToolErrorKind::UserRejected));
        assert_eq!(back.user_display.as_deref(), Some("no"));
    }
}
