//! `AgentManager` (`spec.md` §4.6, `SPEC_FULL.md` §4.6): the multiplexer that
//! owns the meta/task agent workers, the unified output channel, the
//! per-session output queues, and the `execute_task` FIFO wiring.
//!
//! Ported from `agents/agent_manager.py`'s `_route_agent_outputs` (the router)
//! and `_intercept_execute_task`; the per-agent worker recovery loop lives in
//! [`worker`].

pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conclave_types::{AgentId, Message, MessagePayload, SessionId, ToolCallId};
use futures::Stream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentLoop, AgentRole, TaskCatalog, TaskInterceptor};
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::interfaces::{Generator, MemoryStore, ToolExecutor};

/// `min(60, 2^(n - 5))` once a worker exceeds this many consecutive errors,
/// matching the original source's `_run_meta_agent`/`_run_task_agent`.
const AGENT_MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// The router tolerates more consecutive errors than a single agent worker
/// before backing off, since every session depends on it (`SPEC_FULL.md`
/// §4.6).
const ROUTER_MAX_CONSECUTIVE_ERRORS: u32 = 10;
const ROUTER_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// A session with no routed traffic for this long is reclaimed by the idle
/// reaper (`spec.md` §3's `SessionQueue`: "destroyed ... after an idle
/// timeout").
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const IDLE_REAP_INTERVAL: Duration = Duration::from_secs(60);

struct SessionEntry {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Message>>>,
    last_activity: Instant,
}

struct Shared {
    sessions: AsyncMutex<HashMap<SessionId, SessionEntry>>,
    /// `tool_id -> owning agent`, populated when an `ApprovalRequest` is
    /// routed and cleared once that tool resolves. Lets `submit` send an
    /// `ApprovalResponse` to "whichever agent currently owns the matching
    /// pending tool_id" (`spec.md` §4.6's `Submit` contract).
    pending_approvals: AsyncMutex<HashMap<ToolCallId, AgentId>>,
    task_interceptor: Arc<TaskInterceptor>,
    meta_agent_id: AgentId,
    task_agent_id: AgentId,
    meta_input: mpsc::UnboundedSender<Message>,
    task_input: mpsc::UnboundedSender<Message>,
}

/// The multiplexer described in `spec.md` §4.6. Construct with [`AgentManager::spawn`];
/// drop (or call [`AgentManager::shutdown`]) to stop every worker task.
pub struct AgentManager {
    shared: Arc<Shared>,
    cancellation: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl AgentManager {
    /// Builds the meta and task agents, wires the `execute_task` interceptor
    /// between them, and spawns their worker tasks plus the router and the
    /// idle-session reaper.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        generator: Arc<dyn Generator>,
        tool_executor: Arc<dyn ToolExecutor>,
        memory_store: Option<Arc<dyn MemoryStore>>,
        task_catalog: Box<dyn TaskCatalog>,
        config: Config,
        meta_tools: Vec<String>,
        task_tools: Vec<String>,
    ) -> Self {
        let meta_agent_id = AgentId::new("METAGEN");
        let task_agent_id = AgentId::new("TASK_AGENT_1");

        let (meta_tx, meta_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let task_interceptor = Arc::new(TaskInterceptor::new(
            task_catalog,
            task_tx.clone(),
            task_agent_id.clone(),
        ));

        let meta_loop = Arc::new(
            AgentLoop::new(
                meta_agent_id.clone(),
                AgentRole::Meta,
                generator.clone(),
                tool_executor.clone(),
                memory_store.clone(),
                config.clone(),
                meta_tools,
            )
            .with_task_interceptor(task_interceptor.clone()),
        );
        // `spec.md` §4.6: "The task agent must disable execute_task in its own
        // tool set to prevent recursive dispatch" — achieved here simply by
        // never calling `with_task_interceptor` on it.
        let task_loop = Arc::new(AgentLoop::new(
            task_agent_id.clone(),
            AgentRole::Task,
            generator,
            tool_executor,
            memory_store,
            config,
            task_tools,
        ));

        let cancellation = CancellationToken::new();
        let mut workers = vec![
            worker::spawn_supervised(
                meta_loop,
                meta_rx,
                output_tx.clone(),
                cancellation.clone(),
                AGENT_MAX_CONSECUTIVE_ERRORS,
            ),
            worker::spawn_supervised(
                task_loop,
                task_rx,
                output_tx,
                cancellation.clone(),
                AGENT_MAX_CONSECUTIVE_ERRORS,
            ),
        ];

        let shared = Arc::new(Shared {
            sessions: AsyncMutex::new(HashMap::new()),
            pending_approvals: AsyncMutex::new(HashMap::new()),
            task_interceptor,
            meta_agent_id,
            task_agent_id,
            meta_input: meta_tx,
            task_input: task_tx,
        });

        workers.push(spawn_router(shared.clone(), output_rx, cancellation.clone()));
        workers.push(spawn_idle_reaper(shared.clone(), cancellation.clone()));

        Self {
            shared,
            cancellation,
            workers,
        }
    }

    /// `RegisterSession(session_id) -> Queue` (`spec.md` §4.6). Idempotent:
    /// calling this twice for the same id is a no-op the second time.
    pub async fn register_session(&self, session_id: SessionId) {
        let mut sessions = self.shared.sessions.lock().await;
        sessions.entry(session_id).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            SessionEntry {
                sender: tx,
                receiver: Arc::new(AsyncMutex::new(rx)),
                last_activity: Instant::now(),
            }
        });
    }

    /// `UnregisterSession(session_id)` (`spec.md` §4.6).
    pub async fn unregister_session(&self, session_id: &SessionId) {
        self.shared.sessions.lock().await.remove(session_id);
    }

    /// `Submit(message)` (`spec.md` §4.6): a `User` message goes to the meta
    /// agent's mailbox; an `ApprovalResponse` goes to whichever agent
    /// currently owns that `tool_id`, or is dropped with a warning if none
    /// does (an approval that already timed out, or was never valid).
    pub async fn submit(&self, message: Message) -> Result<()> {
        match &message.payload {
            MessagePayload::User { .. } => self
                .shared
                .meta_input
                .send(message)
                .map_err(|_| CoreError::UnknownAgent(self.shared.meta_agent_id.to_string())),
            MessagePayload::ApprovalResponse { tool_id, .. } => {
                let owner = self.shared.pending_approvals.lock().await.get(tool_id).cloned();
                match owner {
                    Some(agent_id) if agent_id == self.shared.meta_agent_id => self
                        .shared
                        .meta_input
                        .send(message)
                        .map_err(|_| CoreError::UnknownAgent(agent_id.to_string())),
                    Some(agent_id) if agent_id == self.shared.task_agent_id => self
                        .shared
                        .task_input
                        .send(message)
                        .map_err(|_| CoreError::UnknownAgent(agent_id.to_string())),
                    Some(unknown) => Err(CoreError::UnknownAgent(unknown.to_string())),
                    None => {
                        warn!(%tool_id, "approval response for unknown or already-resolved tool id");
                        Ok(())
                    }
                }
            }
            other => {
                warn!(?other, "Submit only accepts User or ApprovalResponse messages");
                Err(CoreError::UnknownAgent("unsupported message type".to_string()))
            }
        }
    }

    /// `StreamSession(session_id) -> stream<Message>` (`spec.md` §4.6).
    ///
    /// Yields every message routed to `session_id` until the **meta agent's**
    /// own `Agent{final=true}` message is observed — sub-agent events (e.g. a
    /// dispatched task agent's turn, per S5) are forwarded but do not end the
    /// stream, since the client's synchronous result is the meta agent's
    /// reply (`spec.md` §1: "the meta agent receives a single synchronous
    /// result when the task finishes"). Serializes concurrent callers on the
    /// same session to one at a time, matching "exactly one consumer per
    /// session" (`spec.md` §5).
    pub async fn stream_session(
        &self,
        session_id: SessionId,
    ) -> Result<impl Stream<Item = Message> + use<>> {
        let receiver = {
            let sessions = self.shared.sessions.lock().await;
            let entry = sessions
                .get(&session_id)
                .ok_or_else(|| CoreError::UnknownSession(session_id.to_string()))?;
            entry.receiver.clone()
        };
        let meta_agent_id = self.shared.meta_agent_id.clone();

        Ok(async_stream::stream! {
            let mut receiver = receiver.lock().await;
            while let Some(message) = receiver.recv().await {
                let done = message.agent_id == meta_agent_id && message.is_final_agent_message();
                yield message;
                if done {
                    break;
                }
            }
        })
    }

    /// Cancels every worker and the router, then waits for them to stop.
    pub async fn shutdown(self) {
        self.cancellation.cancel();
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

fn spawn_router(
    shared: Arc<Shared>,
    mut output: mpsc::UnboundedReceiver<Message>,
    cancellation: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("starting message router");
        let mut consecutive_errors: u32 = 0;
        loop {
            let message = tokio::select! {
                biased;
                () = cancellation.cancelled() => {
                    info!("router cancelled, draining remaining output");
                    while let Ok(message) = output.try_recv() {
                        route_one(&shared, message).await;
                    }
                    return;
                }
                received = output.recv() => received,
            };

            let Some(message) = message else {
                info!("unified output channel closed, router exiting");
                return;
            };

            route_one(&shared, message).await;
            consecutive_errors = consecutive_errors.saturating_sub(1);
            let _ = consecutive_errors; // see note below: route_one never fails today.
        }
    })
}

/// Routes one message onto its session queue, maintaining the
/// `pending_approvals` table and fulfilling the `execute_task` FIFO.
///
/// `route_one` has no fallible path in this implementation (the original's
/// `_route_agent_outputs` wraps arbitrary per-message side effects and can
/// raise; ours only touches in-process maps), so the router's
/// `ROUTER_MAX_CONSECUTIVE_ERRORS`/backoff machinery is dead code today. It is
/// kept as the seam future routing side effects (e.g. a durable outbox) would
/// need to hook into, per `spec.md` §7's "Worker crashes" recovery policy.
async fn route_one(shared: &Arc<Shared>, message: Message) {
    match &message.payload {
        MessagePayload::ApprovalRequest { tool_id, .. } => {
            shared
                .pending_approvals
                .lock()
                .await
                .insert(tool_id.clone(), message.agent_id.clone());
        }
        MessagePayload::ToolStarted { tool_id, .. }
        | MessagePayload::ToolResult { tool_id, .. }
        | MessagePayload::ToolError { tool_id, .. } => {
            shared.pending_approvals.lock().await.remove(tool_id);
        }
        _ => {}
    }

    if message.agent_id == shared.task_agent_id
        && message.is_final_agent_message()
        && shared.task_interceptor.has_pending()
    {
        if let MessagePayload::Agent { content, .. } = &message.payload {
            shared.task_interceptor.fulfil_next(content.clone());
        }
    }

    let session_id = message.session_id.clone();
    let mut sessions = shared.sessions.lock().await;
    match sessions.get_mut(&session_id) {
        Some(entry) => {
            entry.last_activity = Instant::now();
            if entry.sender.send(message).is_err() {
                warn!(%session_id, "session queue has no active consumer, dropping session");
                sessions.remove(&session_id);
            }
        }
        None => debug!(%session_id, "no session registered for routed message, dropping"),
    }
}

fn spawn_idle_reaper(shared: Arc<Shared>, cancellation: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => return,
                () = tokio::time::sleep(IDLE_REAP_INTERVAL) => {}
            }

            let mut sessions = shared.sessions.lock().await;
            let before = sessions.len();
            sessions.retain(|_, entry| entry.last_activity.elapsed() < SESSION_IDLE_TIMEOUT);
            let reaped = before - sessions.len();
            if reaped > 0 {
                debug!(reaped, "reclaimed idle session queues");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EchoTaskCatalog, MapToolExecutor, ScriptedGenerator};
    use futures::StreamExt;

    fn manager_with(generator: ScriptedGenerator) -> AgentManager {
        AgentManager::spawn(
            Arc::new(generator),
            Arc::new(MapToolExecutor::new()),
            None,
            Box::new(EchoTaskCatalog::new::<[(&str, &str); 0], &str, &str>([])),
            Config::default(),
            vec![],
            vec![],
        )
    }

    #[tokio::test]
    async fn register_session_is_idempotent() {
        let manager = manager_with(ScriptedGenerator::new(vec![]));
        let session = SessionId::new("s1");
        manager.register_session(session.clone()).await;
        manager.register_session(session.clone()).await;
        assert_eq!(manager.shared.sessions.lock().await.len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unregister_session_removes_it() {
        let manager = manager_with(ScriptedGenerator::new(vec![]));
        let session = SessionId::new("s1");
        manager.register_session(session.clone()).await;
        manager.unregister_session(&session).await;
        assert!(manager.shared.sessions.lock().await.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn submit_rejects_unsupported_message_types() {
        let manager = manager_with(ScriptedGenerator::new(vec![]));
        let err = manager
            .submit(Message::new(
                AgentId::new("client"),
                SessionId::new("s1"),
                MessagePayload::Thinking { content: "nope".to_string() },
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownAgent(_)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn orphan_approval_is_a_no_op() {
        let manager = manager_with(ScriptedGenerator::new(vec![]));
        manager
            .submit(Message::new(
                AgentId::new("client"),
                SessionId::new("s1"),
                MessagePayload::ApprovalResponse {
                    tool_id: ToolCallId::new("never-seen"),
                    decision: conclave_types::ApprovalDecision::Approved,
                    feedback: None,
                },
            ))
            .await
            .expect("orphan approvals are logged and dropped, not errors");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stream_session_errors_for_unregistered_session() {
        let manager = manager_with(ScriptedGenerator::new(vec![]));
        let err = manager.stream_session(SessionId::new("ghost")).await.err();
        assert!(matches!(err, Some(CoreError::UnknownSession(_))));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn s1_plain_chat_terminates_stream_on_meta_final() {
        let generator = ScriptedGenerator::new(vec![crate::testing::GeneratorResponse::text("Hi")]);
        let manager = manager_with(generator);
        let session = SessionId::new("s1");
        manager.register_session(session.clone()).await;

        manager
            .submit(Message::new(
                AgentId::new("client"),
                session.clone(),
                MessagePayload::User { content: "Hello".to_string() },
            ))
            .await
            .unwrap();

        let stream = manager.stream_session(session).await.unwrap();
        let messages: Vec<Message> = stream.collect().await;

        assert!(matches!(messages[0].payload, MessagePayload::Thinking { .. }));
        let last = messages.last().unwrap();
        assert!(last.is_final_agent_message());
        assert!(matches!(&last.payload, MessagePayload::Agent { content, .. } if content == "Hi"));

        manager.shutdown().await;
    }
}
