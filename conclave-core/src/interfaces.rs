//! External collaborator traits (`spec.md` §4.7, `SPEC_FULL.md` §4.7).
//!
//! These are the seams the orchestration core is built against but does not
//! implement: the language-model client, the concrete tool registry, durable
//! storage, and the approval transport. Each is `async_trait` and object-safe
//! so a running [`crate::manager::AgentManager`] can hold `Arc<dyn Trait>`
//! handles shared across every agent worker, mirroring the teacher's
//! `Arc<dyn Workspace>` / `Arc<dyn ModelClient>` style.

use async_trait::async_trait;
use conclave_types::{Message, ToolCall, ToolResult};
use std::fmt;

/// The abstraction over the language model (`spec.md` §4.7).
///
/// `stream` produces at most one final `Agent` message per invocation, plus
/// zero or more `Thinking`/`Usage` messages and at most one `ToolCall` message
/// listing every tool request for this turn.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn stream(
        &self,
        messages: &[Message],
        tools: &[String],
        prev_tool_calls: Option<&[ToolCall]>,
        prev_tool_results: Option<&[ToolResult]>,
    ) -> Result<Vec<Message>, GeneratorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("transient generator error: {0}")]
    Transient(String),
    #[error("generator error: {0}")]
    Fatal(String),
}

/// `Execute(ToolCall) -> ToolResult` (`spec.md` §4.7). Idempotent from the
/// caller's perspective; never raises — failures are folded into the returned
/// `ToolResult`.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> ToolResult;

    /// Whether `name` is a tool this executor knows how to run at all. Used
    /// by the tool flow to reject unknown tools before ever calling
    /// `execute` (`spec.md` §4.3 step 2).
    fn knows_tool(&self, name: &str) -> bool;
}

/// Durable persistence of turns and tool usage (`spec.md` §4.7). All calls
/// are best-effort: failures are logged by the caller, except that a failure
/// from a call made during `ToolTracker::update_stage` is fatal to that
/// transition (`spec.md` §4.1).
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn create_turn(&self, request: TurnRequest) -> Result<String, MemoryError>;
    async fn complete_turn(&self, completion: TurnCompletion) -> Result<(), MemoryError>;
    async fn record_tool_usage(&self, usage: ToolUsageRecord) -> Result<String, MemoryError>;
    async fn update_tool_approval(
        &self,
        record_id: &str,
        approved: bool,
        user_feedback: Option<&str>,
    ) -> Result<(), MemoryError>;
    async fn start_tool_execution(&self, record_id: &str) -> Result<(), MemoryError>;
    async fn complete_tool_execution(
        &self,
        completion: ToolExecutionCompletion,
    ) -> Result<(), MemoryError>;
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub agent_id: String,
    pub turn_number: u64,
    pub user_query: String,
}

#[derive(Debug, Clone)]
pub struct TurnCompletion {
    pub turn_id: String,
    pub agent_response: String,
    pub status: crate::turn::TurnStatus,
    pub error_details: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolUsageRecord {
    pub turn_id: String,
    pub agent_id: String,
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub requires_approval: bool,
}

#[derive(Debug, Clone)]
pub struct ToolExecutionCompletion {
    pub record_id: String,
    pub success: bool,
    pub result: Option<ToolResult>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
#[error("memory store error: {0}")]
pub struct MemoryError(pub String);

/// One outbound approval request paired with exactly one inbound response
/// (`SPEC_FULL.md` §4.7). The transport itself has no timeout; the
/// approval-timeout mechanism in `spec.md` §4.5 is what unblocks a waiter if
/// the transport never resolves.
#[async_trait]
pub trait ApprovalTransport: Send + Sync {
    async fn request(
        &self,
        request: conclave_types::Message,
    ) -> Result<conclave_types::Message, ApprovalTransportError>;
}

#[derive(Debug, thiserror::Error)]
#[error("approval transport error: {0}")]
pub struct ApprovalTransportError(pub String);

impl fmt::Debug for dyn Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<dyn Generator>")
    }
}

impl fmt::Debug for dyn ToolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<dyn ToolExecutor>")
    }
}

impl fmt::Debug for dyn MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<dyn MemoryStore>")
    }
}
