//! In-memory test doubles for the external collaborator interfaces
//! (`SPEC_FULL.md` §4.7, §8). Grounded on the teacher's `test_utils.rs`
//! convention of shipping lightweight in-process fakes as a plain (not
//! `cfg(test)`-gated) public module next to the traits they implement, so
//! downstream embedders can reuse them in their own integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use conclave_types::{
    message::ToolCallRequest, AgentId, Message, MessagePayload, SessionId, ToolCall, ToolResult,
};

use crate::agent::TaskCatalog;
use crate::interfaces::{
    Generator, GeneratorError, MemoryError, MemoryStore, ToolExecutionCompletion, ToolExecutor,
    ToolUsageRecord, TurnCompletion, TurnRequest,
};
use crate::turn::TurnCounter;

/// One canned reply a test [`Generator`] double hands back for a single
/// `stream` call.
pub enum GeneratorResponse {
    Text(String),
    ToolCalls(Vec<(String, String, serde_json::Value)>),
    Fail(GeneratorError),
}

impl GeneratorResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    pub fn tool_calls<I, N>(calls: Vec<(I, N, serde_json::Value)>) -> Self
    where
        I: Into<String>,
        N: Into<String>,
    {
        Self::ToolCalls(
            calls
                .into_iter()
                .map(|(id, name, args)| (id.into(), name.into(), args))
                .collect(),
        )
    }

    fn into_messages(self) -> Result<Vec<Message>, GeneratorError> {
        let placeholder_agent = AgentId::new("__generator__");
        let placeholder_session = SessionId::new("__generator__");
        match self {
            GeneratorResponse::Text(content) => Ok(vec![Message::new(
                placeholder_agent,
                placeholder_session,
                MessagePayload::Agent { content, is_final: false },
            )]),
            GeneratorResponse::ToolCalls(calls) => Ok(vec![Message::new(
                placeholder_agent,
                placeholder_session,
                MessagePayload::ToolCall {
                    tool_calls: calls
                        .into_iter()
                        .map(|(tool_id, tool_name, tool_args)| ToolCallRequest {
                            tool_id: tool_id.into(),
                            tool_name,
                            tool_args,
                        })
                        .collect(),
                },
            )]),
            GeneratorResponse::Fail(err) => Err(err),
        }
    }
}

/// A [`Generator`] double that replays a fixed sequence of responses, one per
/// call to `stream`, regardless of the messages/tools it is actually given.
/// Suitable when a test only needs one agent's worth of scripted turns.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<GeneratorResponse>>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<GeneratorResponse>) -> Self {
        Self { responses: Mutex::new(responses.into()) }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn stream(
        &self,
        _messages: &[Message],
        _tools: &[String],
        _prev_tool_calls: Option<&[ToolCall]>,
        _prev_tool_results: Option<&[ToolResult]>,
    ) -> Result<Vec<Message>, GeneratorError> {
        let next = self.responses.lock().expect("scripted generator poisoned").pop_front();
        match next {
            Some(response) => response.into_messages(),
            None => Ok(vec![]),
        }
    }
}

/// A [`Generator`] double keyed by call number (1-indexed), for scenarios
/// where two agents (meta and task) share one `Arc<dyn Generator>` but need
/// distinguishable scripted turns interleaved across both of them.
#[derive(Default)]
pub struct KeyedGenerator {
    by_call: Mutex<HashMap<u64, GeneratorResponse>>,
    next_call: Mutex<u64>,
}

impl KeyedGenerator {
    pub fn new() -> Self {
        Self { by_call: Mutex::new(HashMap::new()), next_call: Mutex::new(0) }
    }

    pub fn on_call(self, call_number: u64, response: GeneratorResponse) -> Self {
        self.by_call
            .lock()
            .expect("keyed generator poisoned")
            .insert(call_number, response);
        self
    }
}

#[async_trait]
impl Generator for KeyedGenerator {
    async fn stream(
        &self,
        _messages: &[Message],
        _tools: &[String],
        _prev_tool_calls: Option<&[ToolCall]>,
        _prev_tool_results: Option<&[ToolResult]>,
    ) -> Result<Vec<Message>, GeneratorError> {
        let call_number = {
            let mut next = self.next_call.lock().expect("keyed generator poisoned");
            *next += 1;
            *next
        };
        let response = self
            .by_call
            .lock()
            .expect("keyed generator poisoned")
            .remove(&call_number);
        match response {
            Some(response) => response.into_messages(),
            None => Ok(vec![]),
        }
    }
}

type ToolHandler = Box<dyn Fn(&ToolCall) -> ToolResult + Send + Sync>;

/// A [`ToolExecutor`] double backed by a map of tool name to handler closure.
#[derive(Default)]
pub struct MapToolExecutor {
    handlers: HashMap<String, ToolHandler>,
}

impl MapToolExecutor {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn with_tool(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&ToolCall) -> ToolResult + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }
}

#[async_trait]
impl ToolExecutor for MapToolExecutor {
    async fn execute(&self, call: &ToolCall) -> ToolResult {
        match self.handlers.get(&call.name) {
            Some(handler) => handler(call),
            None => ToolResult::failure(
                call.id.clone(),
                call.name.clone(),
                format!("no handler registered for tool '{}'", call.name),
                conclave_types::ToolErrorKind::ExecutionError,
            ),
        }
    }

    fn knows_tool(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

/// A [`TaskCatalog`] double mapping `task_id -> prompt` from a fixed table.
pub struct EchoTaskCatalog {
    prompts: HashMap<String, String>,
}

impl EchoTaskCatalog {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            prompts: entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl TaskCatalog for EchoTaskCatalog {
    fn prompt_for(&self, task_id: &str, _input_values: &serde_json::Value) -> Option<String> {
        self.prompts.get(task_id).cloned()
    }
}

#[derive(Debug, Clone)]
struct StoredTurn {
    completion: Option<TurnCompletion>,
}

/// An in-memory [`MemoryStore`] double that records every call it receives,
/// for tests asserting on persistence side effects. Turn ids are minted from
/// a shared [`TurnCounter`] keyed by agent, matching the monotonicity
/// invariant real stores must uphold (`spec.md` §8 invariant 3).
#[derive(Default)]
pub struct InMemoryMemoryStore {
    turns: Mutex<HashMap<String, StoredTurn>>,
    tool_usage: Mutex<HashMap<String, ToolUsageRecord>>,
    tool_approvals: Mutex<Vec<(String, bool, Option<String>)>>,
    turn_counter: Mutex<TurnCounter>,
    next_tool_record: Mutex<u64>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn_count(&self) -> usize {
        self.turns.lock().expect("memory store poisoned").len()
    }

    pub fn completed_turns(&self) -> Vec<TurnCompletion> {
        self.turns
            .lock()
            .expect("memory store poisoned")
            .values()
            .filter_map(|t| t.completion.clone())
            .collect()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn create_turn(&self, request: TurnRequest) -> Result<String, MemoryError> {
        let turn_number = self
            .turn_counter
            .lock()
            .expect("memory store poisoned")
            .next(&AgentId::new(request.agent_id.clone()));
        let turn_id = format!("{}-{turn_number}", request.agent_id);
        self.turns
            .lock()
            .expect("memory store poisoned")
            .insert(turn_id.clone(), StoredTurn { completion: None });
        Ok(turn_id)
    }

    async fn complete_turn(&self, completion: TurnCompletion) -> Result<(), MemoryError> {
        let mut turns = self.turns.lock().expect("memory store poisoned");
        match turns.get_mut(&completion.turn_id) {
            Some(turn) => {
                turn.completion = Some(completion);
                Ok(())
            }
            None => Err(MemoryError(format!("unknown turn id '{}'", completion.turn_id))),
        }
    }

    async fn record_tool_usage(&self, usage: ToolUsageRecord) -> Result<String, MemoryError> {
        let record_id = {
            let mut next = self.next_tool_record.lock().expect("memory store poisoned");
            *next += 1;
            format!("tool-usage-{next}")
        };
        self.tool_usage
            .lock()
            .expect("memory store poisoned")
            .insert(record_id.clone(), usage);
        Ok(record_id)
    }

    async fn update_tool_approval(
        &self,
        record_id: &str,
        approved: bool,
        user_feedback: Option<&str>,
    ) -> Result<(), MemoryError> {
        self.tool_approvals.lock().expect("memory store poisoned").push((
            record_id.to_string(),
            approved,
            user_feedback.map(str::to_string),
        ));
        Ok(())
    }

    async fn start_tool_execution(&self, _record_id: &str) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn complete_tool_execution(
        &self,
        _completion: ToolExecutionCompletion,
    ) -> Result<(), MemoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_generator_replays_in_order_then_returns_empty() {
        let generator = ScriptedGenerator::new(vec![GeneratorResponse::text("a"), GeneratorResponse::text("b")]);
        let first = generator.stream(&[], &[], None, None).await.unwrap();
        let second = generator.stream(&[], &[], None, None).await.unwrap();
        let third = generator.stream(&[], &[], None, None).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn keyed_generator_dispatches_by_call_number() {
        let generator = KeyedGenerator::new()
            .on_call(2, GeneratorResponse::text("second"))
            .on_call(1, GeneratorResponse::text("first"));
        let first = generator.stream(&[], &[], None, None).await.unwrap();
        let second = generator.stream(&[], &[], None, None).await.unwrap();
        assert!(matches!(&first[0].payload, MessagePayload::Agent { content, .. } if content == "first"));
        assert!(matches!(&second[0].payload, MessagePayload::Agent { content, .. } if content == "second"));
    }

    #[tokio::test]
    async fn map_tool_executor_dispatches_by_name() {
        let executor = MapToolExecutor::new()
            .with_tool("calc", |call| ToolResult::success(call.id.clone(), "calc", serde_json::json!(2)));
        assert!(executor.knows_tool("calc"));
        assert!(!executor.knows_tool("write_file"));
        let result = executor.execute(&ToolCall::new("1", "calc", serde_json::json!({}))).await;
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_a_turn() {
        let store = InMemoryMemoryStore::new();
        let turn_id = store
            .create_turn(TurnRequest {
                agent_id: "METAGEN".to_string(),
                turn_number: 1,
                user_query: "hi".to_string(),
            })
            .await
            .unwrap();
        store
            .complete_turn(TurnCompletion {
                turn_id: turn_id.clone(),
                agent_response: "hi back".to_string(),
                status: crate::turn::TurnStatus::Completed,
                error_details: None,
            })
            .await
            .unwrap();
        assert_eq!(store.turn_count(), 1);
        assert_eq!(store.completed_turns().len(), 1);
    }
}
