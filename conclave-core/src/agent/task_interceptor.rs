//! The `execute_task` interceptor (`spec.md` §4.6).
//!
//! Registered against the tool name `execute_task`; when the meta agent's tool
//! flow is about to dispatch that tool, it calls [`TaskInterceptor::dispatch`]
//! instead of `ToolExecutor::execute`. FIFO ordering is guaranteed because
//! `pending_task_completions` is a strict queue and the task agent processes
//! its input mailbox serially (`SPEC_FULL.md` §9, open question 1).

use std::collections::VecDeque;
use std::sync::Mutex;

use conclave_types::{AgentId, Message, MessagePayload, SessionId, ToolCall, ToolErrorKind, ToolResult};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Looks up the prompt to run for a given `task_id`. A real embedder would
/// back this with its own task catalogue; `spec.md` leaves task definitions
/// entirely out of scope beyond "look up the task definition by task_id".
pub trait TaskCatalog: Send + Sync {
    fn prompt_for(&self, task_id: &str, input_values: &serde_json::Value) -> Option<String>;
}

struct Slot {
    id: u64,
    sender: oneshot::Sender<String>,
}

#[derive(Default)]
struct Fifo {
    next_id: u64,
    slots: VecDeque<Slot>,
}

pub struct TaskInterceptor {
    catalog: Box<dyn TaskCatalog>,
    task_input: mpsc::UnboundedSender<Message>,
    task_agent_id: AgentId,
    fifo: Mutex<Fifo>,
}

impl TaskInterceptor {
    pub fn new(
        catalog: Box<dyn TaskCatalog>,
        task_input: mpsc::UnboundedSender<Message>,
        task_agent_id: AgentId,
    ) -> Self {
        Self {
            catalog,
            task_input,
            task_agent_id,
            fifo: Mutex::new(Fifo::default()),
        }
    }

    /// Called by the router when the task agent's final `Agent` message for the
    /// session arrives. Pops the oldest outstanding slot and fulfils it.
    pub fn fulfil_next(&self, content: String) -> bool {
        let slot = {
            let mut fifo = self.fifo.lock().expect("task fifo poisoned");
            fifo.slots.pop_front()
        };
        match slot {
            Some(slot) => {
                let _ = slot.sender.send(content);
                true
            }
            None => {
                warn!("task agent produced a final message with no pending execute_task caller");
                false
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.fifo.lock().expect("task fifo poisoned").slots.is_empty()
    }

    /// Steps 1-6 of the `execute_task` interceptor protocol.
    pub async fn dispatch(&self, call: &ToolCall, session_id: &SessionId) -> ToolResult {
        let task_id = call
            .arguments
            .get("task_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let input_values = call
            .arguments
            .get("input_values")
            .cloned()
            .unwrap_or(serde_json::Value::Object(Default::default()));

        let Some(prompt) = self.catalog.prompt_for(task_id, &input_values) else {
            return ToolResult::failure(
                call.id.clone(),
                call.name.clone(),
                format!("unknown task_id '{task_id}'"),
                ToolErrorKind::InvalidArgs,
            );
        };

        let (tx, rx) = oneshot::channel();
        let slot_id = {
            let mut fifo = self.fifo.lock().expect("task fifo poisoned");
            let id = fifo.next_id;
            fifo.next_id += 1;
            fifo.slots.push_back(Slot { id, sender: tx });
            id
        };

        info!(task_id, slot_id, "dispatching execute_task");
        let prompt_message = Message::new(
            self.task_agent_id.clone(),
            session_id.clone(),
            MessagePayload::User { content: prompt },
        );
        if self.task_input.send(prompt_message).is_err() {
            self.remove_slot(slot_id);
            return ToolResult::failure(
                call.id.clone(),
                call.name.clone(),
                "task agent is not accepting input",
                ToolErrorKind::ExecutionError,
            );
        }

        match rx.await {
            Ok(content) => {
                ToolResult::success(call.id.clone(), call.name.clone(), serde_json::json!(content))
            }
            Err(_) => {
                self.remove_slot(slot_id);
                ToolResult::failure(
                    call.id.clone(),
                    call.name.clone(),
                    "execute_task cancelled before task agent responded",
                    ToolErrorKind::Timeout,
                )
            }
        }
    }

    fn remove_slot(&self, id: u64) {
        let mut fifo = self.fifo.lock().expect("task fifo poisoned");
        fifo.slots.retain(|slot| slot.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoCatalog;
    impl TaskCatalog for EchoCatalog {
        fn prompt_for(&self, task_id: &str, _input: &serde_json::Value) -> Option<String> {
            (task_id == "T").then(|| "do the thing".to_string())
        }
    }

    #[tokio::test]
    async fn unknown_task_id_is_rejected_without_dispatch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let interceptor =
            TaskInterceptor::new(Box::new(EchoCatalog), tx, AgentId::new("TASK_AGENT_1"));
        let call = ToolCall::new(
            "1",
            "execute_task",
            serde_json::json!({"task_id": "nope", "input_values": {}}),
        );
        let result = interceptor.dispatch(&call, &SessionId::new("s1")).await;
        assert!(result.is_error);
        assert_eq!(result.error_type, Some(ToolErrorKind::InvalidArgs));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fifo_fulfils_callers_in_submission_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let interceptor = std::sync::Arc::new(TaskInterceptor::new(
            Box::new(EchoCatalog),
            tx,
            AgentId::new("TASK_AGENT_1"),
        ));

        let call = ToolCall::new("1", "execute_task", serde_json::json!({"task_id": "T"}));
        let call2 = ToolCall::new("2", "execute_task", serde_json::json!({"task_id": "T"}));

        let i1 = interceptor.clone();
        let first = tokio::spawn(async move { i1.dispatch(&call, &SessionId::new("s1")).await });
        // ensure the first dispatch registers its slot before the second does
        rx.recv().await;

        let i2 = interceptor.clone();
        let second = tokio::spawn(async move { i2.dispatch(&call2, &SessionId::new("s1")).await });
        rx.recv().await;

        assert!(interceptor.fulfil_next("first".to_string()));
        assert!(interceptor.fulfil_next("second".to_string()));

        let r1 = first.await.unwrap();
        let r2 = second.await.unwrap();
        assert_eq!(r1.content, serde_json::json!("first"));
        assert_eq!(r2.content, serde_json::json!("second"));
    }
}
