//! The terminal session never dispatches `execute_task`; this catalog exists
//! purely so `AgentManager::spawn` has a `TaskCatalog` to wire up.

use conclave_core::agent::TaskCatalog;

pub struct EmptyTaskCatalog;

impl TaskCatalog for EmptyTaskCatalog {
    fn prompt_for(&self, _task_id: &str, _input_values: &serde_json::Value) -> Option<String> {
        None
    }
}
