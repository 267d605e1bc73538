//! Top-level error type for the orchestration core (`SPEC_FULL.md` §7).
//!
//! Most of the taxonomy in `spec.md` §7 is represented as *data* — a
//! [`conclave_types::ToolResult`] or a [`conclave_types::MessagePayload::Error`]
//! flowing down the message stream — because the spec says so explicitly
//! ("surfaces as a `ToolError`"). Only the two entries that are genuinely fatal
//! to the operation in progress become a Rust `Result::Err` here: an illegal
//! tracker stage transition, and a non-transient generator failure.

use conclave_types::ToolCallId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("protocol violation: tool {tool_id} cannot transition {from:?} -> {to:?}")]
    ProtocolViolation {
        tool_id: ToolCallId,
        from: crate::tool::ToolStage,
        to: crate::tool::ToolStage,
    },

    #[error("tool {0} not found in tracker")]
    UnknownTool(ToolCallId),

    #[error("generator failed: {0}")]
    Generator(String),

    #[error("persistence failure while updating tool {tool_id}: {source}")]
    Persistence {
        tool_id: ToolCallId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("agent {0} has no registered input mailbox")]
    UnknownAgent(String),

    #[error("session {0} is not registered")]
    UnknownSession(String),

    #[error("configuration error: {0}")]
    Config(String),
}
