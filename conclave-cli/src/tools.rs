//! A minimal `ToolExecutor` (`spec.md` §4.7) backing the terminal session's
//! one built-in tool.

use async_trait::async_trait;
use chrono::Utc;
use conclave_core::interfaces::ToolExecutor;
use conclave_types::ToolCall;
use conclave_types::{ToolErrorKind, ToolResult};

pub struct TerminalToolExecutor;

#[async_trait]
impl ToolExecutor for TerminalToolExecutor {
    async fn execute(&self, call: &ToolCall) -> ToolResult {
        match call.name.as_str() {
            "current_time" => ToolResult::success(
                call.id.clone(),
                call.name.clone(),
                serde_json::json!(Utc::now().to_rfc3339()),
            ),
            other => ToolResult::failure(
                call.id.clone(),
                other,
                format!("no such tool: {other}"),
                ToolErrorKind::ExecutionError,
            ),
        }
    }

    fn knows_tool(&self, name: &str) -> bool {
        name == "current_time"
    }
}
