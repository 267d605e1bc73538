pub mod ids;
pub mod message;
pub mod tool;

pub use ids::{AgentId, RequestId, SessionId, ToolCallId, TurnId};
pub use message::{Message, MessagePayload};
pub use tool::{ApprovalDecision, ToolCall, ToolErrorKind, ToolResult};
