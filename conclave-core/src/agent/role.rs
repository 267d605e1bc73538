//! MetaAgent / TaskAgent specialisation (`spec.md` §4.6's "MetaAgent / TaskAgent").
//!
//! The two roles share the entire `AgentLoop` implementation; they differ only
//! in their system prompt and in whether `execute_task` is a legal tool call.

/// Which of the two long-lived agent roles an `AgentLoop` instance is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// The single agent a client talks to directly. May dispatch `execute_task`.
    Meta,
    /// A dedicated task-executing agent. Must never dispatch `execute_task` itself
    /// (`spec.md` §4.6: "The task agent must disable execute_task in its own tool
    /// set to prevent recursive dispatch").
    Task,
}

impl AgentRole {
    pub fn allows_execute_task(self) -> bool {
        matches!(self, AgentRole::Meta)
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            AgentRole::Meta => {
                "You are the primary assistant for this conversation. You may delegate \
                 well-defined units of work to a task agent via the execute_task tool."
            }
            AgentRole::Task => {
                "You are a task-executing agent. Complete the assigned task and report a \
                 final result; you cannot delegate further tasks."
            }
        }
    }
}
