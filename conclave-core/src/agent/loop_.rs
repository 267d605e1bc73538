//! `AgentLoop` (`spec.md` §4.2): the bounded generate/tool-flow conversation loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use conclave_types::{AgentId, Message, MessagePayload, SessionId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::policy::ApprovalPolicy;
use crate::agent::role::AgentRole;
use crate::agent::task_interceptor::TaskInterceptor;
use crate::agent::tool_flow::{run_tool_flow, ToolFlowContext};
use crate::config::Config;
use crate::interfaces::{
    Generator, GeneratorError, MemoryStore, ToolExecutor, TurnCompletion, TurnRequest,
};
use crate::turn::TurnStatus;

/// One long-lived logical agent (`spec.md` §2's "MetaAgent / TaskAgent").
///
/// Owns no mutable shared state beyond an atomic turn counter: everything
/// else a turn needs (the tracker, the tool-flow context) is scoped to that
/// turn's invocation, per `spec.md` §3's ownership rule ("each agent owns at
/// most one live ToolTracker").
pub struct AgentLoop {
    pub agent_id: AgentId,
    pub role: AgentRole,
    generator: Arc<dyn Generator>,
    tool_executor: Arc<dyn ToolExecutor>,
    memory_store: Option<Arc<dyn MemoryStore>>,
    approval_policy: ApprovalPolicy,
    task_interceptor: Option<Arc<TaskInterceptor>>,
    config: Config,
    turn_counter: AtomicU64,
    available_tools: Vec<String>,
}

impl AgentLoop {
    pub fn new(
        agent_id: AgentId,
        role: AgentRole,
        generator: Arc<dyn Generator>,
        tool_executor: Arc<dyn ToolExecutor>,
        memory_store: Option<Arc<dyn MemoryStore>>,
        config: Config,
        available_tools: Vec<String>,
    ) -> Self {
        let approval_policy =
            ApprovalPolicy::new(config.require_tool_approval, config.auto_approve_tools.clone());
        Self {
            agent_id,
            role,
            generator,
            tool_executor,
            memory_store,
            approval_policy,
            task_interceptor: None,
            config,
            turn_counter: AtomicU64::new(0),
            available_tools,
        }
    }

    pub fn with_task_interceptor(mut self, interceptor: Arc<TaskInterceptor>) -> Self {
        assert!(self.role.allows_execute_task(), "only the meta agent may dispatch execute_task");
        self.task_interceptor = Some(interceptor);
        self
    }

    /// The long-running worker body (`spec.md` §4.6's "MetaAgent worker" /
    /// "TaskAgent worker"): pops one message at a time from `mailbox` and
    /// drives it through [`Self::stream_chat`], forwarding everything onto
    /// `output` until the mailbox closes, `cancellation` fires, or a fatal
    /// generator error propagates out of a turn — per `spec.md` §7, that
    /// error re-raises here so `spawn_supervised`'s restart policy applies,
    /// matching the original source's `base.py` (`raise` out of the loop).
    #[instrument(skip_all, fields(agent_id = %self.agent_id))]
    pub async fn run(
        &self,
        mailbox: &mut mpsc::UnboundedReceiver<Message>,
        output: mpsc::UnboundedSender<Message>,
        cancellation: CancellationToken,
    ) -> Result<(), GeneratorError> {
        loop {
            let message = tokio::select! {
                biased;
                () = cancellation.cancelled() => {
                    info!("agent worker cancelled, shutting down");
                    return Ok(());
                }
                received = mailbox.recv() => received,
            };

            let Some(message) = message else {
                info!("agent mailbox closed, worker exiting");
                return Ok(());
            };

            match &message.payload {
                MessagePayload::User { .. } => {
                    self.stream_chat(message, mailbox, &output, &cancellation).await?;
                }
                MessagePayload::ApprovalResponse { .. } => {
                    // Only reachable when no tool flow is currently waiting on this
                    // mailbox (that wait drains ApprovalResponse itself) — i.e. this
                    // is always an orphan approval (`spec.md` §4.4, §9 open question 2).
                    warn!("orphan approval response: no active tool flow");
                }
                _ => {
                    let _ = output.send(Message::new(
                        self.agent_id.clone(),
                        message.session_id.clone(),
                        MessagePayload::Error {
                            error: "unsupported message type for agent input".to_string(),
                            details: None,
                        },
                    ));
                }
            }
        }
    }

    /// `StreamChat(Message) -> stream<Message>` (`spec.md` §4.2).
    #[instrument(skip_all, fields(agent_id = %self.agent_id, session_id = %message.session_id))]
    async fn stream_chat(
        &self,
        message: Message,
        mailbox: &mut mpsc::UnboundedReceiver<Message>,
        output: &mpsc::UnboundedSender<Message>,
        cancellation: &CancellationToken,
    ) -> Result<(), GeneratorError> {
        let MessagePayload::User { content: user_query } = message.payload else {
            return Ok(());
        };
        let session_id = message.session_id;
        let turn_number = self.turn_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let turn_id = match &self.memory_store {
            Some(store) => store
                .create_turn(TurnRequest {
                    agent_id: self.agent_id.to_string(),
                    turn_number,
                    user_query: user_query.clone(),
                })
                .await
                .unwrap_or_else(|err| {
                    error!(%err, "failed to persist turn creation");
                    format!("{}-{turn_number}", self.agent_id)
                }),
            None => format!("{}-{turn_number}", self.agent_id),
        };

        self.emit(output, &session_id, MessagePayload::Thinking {
            content: "Processing your request…".to_string(),
        });

        let history = vec![
            Message::new(
                self.agent_id.clone(),
                session_id.clone(),
                MessagePayload::System { content: self.role.system_prompt().to_string() },
            ),
            Message::new(
                self.agent_id.clone(),
                session_id.clone(),
                MessagePayload::User { content: user_query.clone() },
            ),
        ];
        let mut prev_tool_calls: Option<Vec<conclave_types::ToolCall>> = None;
        let mut prev_tool_results: Option<Vec<conclave_types::ToolResult>> = None;
        let mut tools_used = false;
        let mut iteration = 0u32;
        let mut total_input_tokens = 0u64;
        let mut total_output_tokens = 0u64;
        let mut final_text = String::new();
        let mut generator_failed = false;
        let mut fatal_error: Option<GeneratorError> = None;

        while iteration < self.config.max_iterations {
            let generated = match self.call_generator_with_retry(
                &history,
                prev_tool_calls.as_deref(),
                prev_tool_results.as_deref(),
            ).await {
                Ok(messages) => messages,
                Err(err) => {
                    error!(%err, "generator failed");
                    self.emit(output, &session_id, MessagePayload::Error {
                        error: "generator failure".to_string(),
                        details: Some(err.to_string()),
                    });
                    generator_failed = true;
                    fatal_error = Some(err);
                    break;
                }
            };

            let mut buffered_agent: Option<String> = None;
            let mut tool_calls = Vec::new();
            for msg in generated {
                match msg.payload {
                    MessagePayload::Agent { content, .. } => buffered_agent = Some(content),
                    MessagePayload::ToolCall { tool_calls: calls } => {
                        for c in calls {
                            tool_calls.push(conclave_types::ToolCall::new(c.tool_id, c.tool_name, c.tool_args));
                        }
                    }
                    MessagePayload::Usage { input_tokens, output_tokens, .. } => {
                        total_input_tokens += input_tokens;
                        total_output_tokens += output_tokens;
                        self.emit(output, &session_id, msg.payload);
                    }
                    other => self.emit(output, &session_id, other),
                }
            }

            if tool_calls.is_empty() {
                match buffered_agent {
                    Some(content) => {
                        final_text = content.clone();
                        self.emit(output, &session_id, MessagePayload::Agent { content, is_final: true });
                    }
                    None => {
                        self.emit(output, &session_id, MessagePayload::Error {
                            error: "empty response".to_string(),
                            details: None,
                        });
                    }
                }
                break;
            }

            if let Some(content) = buffered_agent {
                self.emit(output, &session_id, MessagePayload::Agent { content, is_final: false });
            }
            self.emit(output, &session_id, MessagePayload::ToolCall {
                tool_calls: tool_calls
                    .iter()
                    .map(|c| conclave_types::message::ToolCallRequest {
                        tool_id: c.id.clone(),
                        tool_name: c.name.clone(),
                        tool_args: c.arguments.clone(),
                    })
                    .collect(),
            });

            let flow_ctx = ToolFlowContext {
                agent_id: &self.agent_id,
                session_id: &session_id,
                turn_id: &turn_id,
                tool_executor: &self.tool_executor,
                memory_store: self.memory_store.as_ref(),
                approval_policy: &self.approval_policy,
                task_interceptor: self.task_interceptor.as_ref(),
                max_tools_per_turn: self.config.max_tools_per_turn,
                max_repeated_calls: self.config.max_repeated_calls,
                show_tool_results: self.config.show_tool_results,
                approval_timeout: self.config.approval_timeout(),
                cancellation,
            };
            let executions = run_tool_flow(&flow_ctx, tool_calls, output, mailbox).await;

            if executions.is_empty() {
                break;
            }
            tools_used = true;
            prev_tool_calls = Some(executions.iter().map(|e| e.call.clone()).collect());
            prev_tool_results = Some(executions.iter().map(|e| e.result.clone()).collect());
            iteration += 1;
        }

        if iteration >= self.config.max_iterations && !generator_failed {
            self.emit(output, &session_id, MessagePayload::Error {
                error: "maximum iterations reached".to_string(),
                details: None,
            });
        }

        let status = if generator_failed {
            TurnStatus::Error
        } else {
            // `SPEC_FULL.md` §9 open question 3: iteration-limit exit still
            // completes the turn, matching the original source's behaviour.
            TurnStatus::Completed
        };

        if let Some(store) = &self.memory_store {
            if let Err(err) = store
                .complete_turn(TurnCompletion {
                    turn_id: turn_id.clone(),
                    agent_response: final_text,
                    status,
                    error_details: generator_failed.then(|| "generator failure".to_string()),
                })
                .await
            {
                error!(%err, "failed to persist turn completion");
            }
        }
        debug!(turn_id, tools_used, total_input_tokens, total_output_tokens, "turn complete");

        match fatal_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn call_generator_with_retry(
        &self,
        history: &[Message],
        prev_tool_calls: Option<&[conclave_types::ToolCall]>,
        prev_tool_results: Option<&[conclave_types::ToolResult]>,
    ) -> Result<Vec<Message>, GeneratorError> {
        const MAX_ATTEMPTS: u32 = 3;
        let mut attempt = 0;
        loop {
            match self
                .generator
                .stream(history, &self.available_tools, prev_tool_calls, prev_tool_results)
                .await
            {
                Ok(messages) => return Ok(messages),
                Err(GeneratorError::Transient(msg)) if attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    warn!(attempt, %msg, "transient generator error, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(200 * u64::from(attempt))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn emit(&self, output: &mpsc::UnboundedSender<Message>, session_id: &SessionId, payload: MessagePayload) {
        let _ = output.send(Message::new(self.agent_id.clone(), session_id.clone(), payload));
    }
}
