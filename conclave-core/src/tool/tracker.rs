//! `TrackedTool` and `ToolTracker` (`spec.md` §4.1, `SPEC_FULL.md` §4.1).
//!
//! Ported from `agents/tool_tracker.py`'s `TrackedTool`/`ToolTracker`: one
//! tracker per batch, a single `HashMap` guarded by one lock so every
//! mutation (`add_tool`, `update_stage`) is atomic with respect to every
//! other, and a one-shot completion signal released exactly when the last
//! pending approval resolves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use conclave_types::{AgentId, ToolCallId, ToolErrorKind, ToolResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info};

use crate::error::{CoreError, Result};
use crate::interfaces::{MemoryStore, ToolExecutionCompletion, ToolUsageRecord};
use crate::tool::call_key;

/// Lifecycle stage of one tracked tool call. Transitions obey the DAG in
/// `spec.md` §3: `PendingApproval -> {Approved, Rejected}`;
/// `Approved -> Executing -> {Completed, Failed}`; `Rejected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStage {
    PendingApproval,
    Approved,
    Rejected,
    Executing,
    Completed,
    Failed,
}

impl ToolStage {
    fn is_legal_successor(self, to: ToolStage) -> bool {
        matches!(
            (self, to),
            (ToolStage::PendingApproval, ToolStage::Approved)
                | (ToolStage::PendingApproval, ToolStage::Rejected)
                | (ToolStage::Approved, ToolStage::Executing)
                | (ToolStage::Executing, ToolStage::Completed)
                | (ToolStage::Executing, ToolStage::Failed)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolStage::Rejected | ToolStage::Completed | ToolStage::Failed
        )
    }
}

#[derive(Debug, Clone)]
pub struct TrackedTool {
    pub tool_id: ToolCallId,
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub stage: ToolStage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub agent_id: Option<AgentId>,
    pub turn_id: Option<String>,
    pub external_record_id: Option<String>,
    pub result: Option<ToolResult>,
    pub error: Option<String>,
    pub error_kind: Option<ToolErrorKind>,
    pub user_feedback: Option<String>,

    previous_stage: Option<ToolStage>,
    execution_started_at: Option<Instant>,
}

impl TrackedTool {
    pub fn new(
        tool_id: ToolCallId,
        tool_name: impl Into<String>,
        tool_args: serde_json::Value,
        stage: ToolStage,
    ) -> Self {
        let now = Utc::now();
        Self {
            tool_id,
            tool_name: tool_name.into(),
            tool_args,
            stage,
            created_at: now,
            updated_at: now,
            agent_id: None,
            turn_id: None,
            external_record_id: None,
            result: None,
            error: None,
            error_kind: None,
            user_feedback: None,
            previous_stage: None,
            execution_started_at: None,
        }
    }

    pub fn with_agent_id(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_turn_id(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = Some(turn_id.into());
        self
    }

    fn update_stage(&mut self, new_stage: ToolStage) {
        self.previous_stage = Some(self.stage);
        self.stage = new_stage;
        self.updated_at = Utc::now();
    }

    fn rollback(&mut self) {
        if let Some(previous) = self.previous_stage.take() {
            self.stage = previous;
        }
    }
}

/// Extra fields accompanying a stage transition (`spec.md` §4.1's `extras`).
#[derive(Debug, Default)]
pub struct StageUpdate {
    pub result: Option<ToolResult>,
    pub error: Option<String>,
    pub error_kind: Option<ToolErrorKind>,
    pub user_feedback: Option<String>,
    pub duration_ms: Option<u64>,
}

struct Inner {
    tools: HashMap<ToolCallId, TrackedTool>,
    pending_approval_count: usize,
    call_history: HashMap<String, u32>,
}

/// A batch-scoped container of `TrackedTool`s (`spec.md` §3/§4.1). One
/// tracker is created per tool-flow invocation (`spec.md` §4.3 step 1).
pub struct ToolTracker {
    inner: Mutex<Inner>,
    notify: Notify,
    signalled: AtomicBool,
    agent_id: Option<AgentId>,
    max_tools_per_turn: usize,
    max_repeated_calls: u32,
    memory_store: Option<Arc<dyn MemoryStore>>,
}

impl ToolTracker {
    pub fn new(
        agent_id: Option<AgentId>,
        max_tools_per_turn: usize,
        max_repeated_calls: u32,
        memory_store: Option<Arc<dyn MemoryStore>>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tools: HashMap::new(),
                pending_approval_count: 0,
                call_history: HashMap::new(),
            }),
            notify: Notify::new(),
            signalled: AtomicBool::new(false),
            agent_id,
            max_tools_per_turn,
            max_repeated_calls,
            memory_store,
        }
    }

    /// `AddTool` (`spec.md` §4.1). Persistence failures are logged but never
    /// abort tracking.
    pub async fn add_tool(&self, mut tool: TrackedTool) {
        if tool.agent_id.is_none() {
            tool.agent_id = self.agent_id.clone();
        }

        let pending = tool.stage == ToolStage::PendingApproval;
        let turn_id = tool.turn_id.clone();
        let tool_id = tool.tool_id.clone();

        {
            let mut inner = self.inner.lock().await;
            if pending {
                inner.pending_approval_count += 1;
                debug!(
                    tool = %tool.tool_name,
                    pending = inner.pending_approval_count,
                    "added pending approval"
                );
            }
            inner.tools.insert(tool_id.clone(), tool.clone());
        }

        if let (Some(store), Some(turn_id)) = (&self.memory_store, turn_id) {
            let record = ToolUsageRecord {
                turn_id,
                agent_id: tool
                    .agent_id
                    .as_ref()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                tool_name: tool.tool_name.clone(),
                tool_args: tool.tool_args.clone(),
                requires_approval: pending,
            };
            match store.record_tool_usage(record).await {
                Ok(record_id) => {
                    let mut inner = self.inner.lock().await;
                    if let Some(tracked) = inner.tools.get_mut(&tool_id) {
                        tracked.external_record_id = Some(record_id);
                    }
                }
                Err(err) => error!(tool_id = %tool_id, error = %err, "failed to record tool usage"),
            }
        }
    }

    pub async fn get_tool(&self, tool_id: &ToolCallId) -> Option<TrackedTool> {
        self.inner.lock().await.tools.get(tool_id).cloned()
    }

    /// `UpdateStage` (`spec.md` §4.1): atomic, validates the DAG, persists,
    /// and rolls back on persistence failure.
    pub async fn update_stage(
        &self,
        tool_id: &ToolCallId,
        new_stage: ToolStage,
        update: StageUpdate,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        let Some(tool) = inner.tools.get_mut(tool_id) else {
            return Ok(false);
        };

        let old_stage = tool.stage;
        if !old_stage.is_legal_successor(new_stage) {
            return Err(CoreError::ProtocolViolation {
                tool_id: tool_id.clone(),
                from: old_stage,
                to: new_stage,
            });
        }

        tool.update_stage(new_stage);
        match new_stage {
            ToolStage::Completed => tool.result = update.result.clone(),
            ToolStage::Failed => tool.error = update.error.clone(),
            ToolStage::Rejected => {
                tool.error = update.error.clone();
                tool.error_kind = update.error_kind;
                tool.user_feedback = update.user_feedback.clone();
            }
            ToolStage::Executing => tool.execution_started_at = Some(Instant::now()),
            ToolStage::Approved => {}
            ToolStage::PendingApproval => unreachable!("no transition re-enters pending_approval"),
        }

        let external_record_id = tool.external_record_id.clone();
        let persisted = if let (Some(store), Some(record_id)) =
            (&self.memory_store, external_record_id.as_deref())
        {
            self.persist_transition(store.as_ref(), record_id, new_stage, &update)
                .await
        } else {
            Ok(())
        };

        if let Err(err) = persisted {
            if let Some(tool) = inner.tools.get_mut(tool_id) {
                tool.rollback();
            }
            return Err(CoreError::Persistence {
                tool_id: tool_id.clone(),
                source: Box::new(err),
            });
        }

        if old_stage == ToolStage::PendingApproval
            && matches!(new_stage, ToolStage::Approved | ToolStage::Rejected)
        {
            inner.pending_approval_count -= 1;
            info!(
                tool = %tool_id,
                stage = ?new_stage,
                remaining = inner.pending_approval_count,
                "approval resolved"
            );
            if inner.pending_approval_count == 0 {
                self.signal_complete();
            }
        }

        Ok(true)
    }

    async fn persist_transition(
        &self,
        store: &dyn MemoryStore,
        record_id: &str,
        new_stage: ToolStage,
        update: &StageUpdate,
    ) -> std::result::Result<(), crate::interfaces::MemoryError> {
        match new_stage {
            ToolStage::Executing => store.start_tool_execution(record_id).await,
            ToolStage::Approved | ToolStage::Rejected => {
                store
                    .update_tool_approval(
                        record_id,
                        new_stage == ToolStage::Approved,
                        update.user_feedback.as_deref(),
                    )
                    .await
            }
            ToolStage::Completed | ToolStage::Failed => {
                store
                    .complete_tool_execution(ToolExecutionCompletion {
                        record_id: record_id.to_string(),
                        success: new_stage == ToolStage::Completed,
                        result: update.result.clone(),
                        error: update.error.clone(),
                        duration_ms: update.duration_ms,
                    })
                    .await
            }
            ToolStage::PendingApproval => Ok(()),
        }
    }

    fn signal_complete(&self) {
        self.signalled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// `WaitForApprovals` (`spec.md` §4.1). Returns immediately if the
    /// pending count has already reached zero.
    pub async fn wait_for_approvals(&self) {
        if self.signalled.load(Ordering::SeqCst) {
            return;
        }
        // Avoid a lost-wakeup race: register interest in Notify before the
        // final re-check, mirroring `tokio::sync::Notify`'s documented
        // single-permit idiom.
        let notified = self.notify.notified();
        if self.signalled.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }

    pub async fn get_tools_by_stage(&self, stage: ToolStage) -> Vec<TrackedTool> {
        self.inner
            .lock()
            .await
            .tools
            .values()
            .filter(|t| t.stage == stage)
            .cloned()
            .collect()
    }

    pub async fn get_pending_approvals(&self) -> Vec<TrackedTool> {
        self.get_tools_by_stage(ToolStage::PendingApproval).await
    }

    pub async fn get_all_tools(&self) -> Vec<TrackedTool> {
        self.inner.lock().await.tools.values().cloned().collect()
    }

    pub async fn count_by_stage(&self) -> HashMap<ToolStage, usize> {
        let inner = self.inner.lock().await;
        let mut counts = HashMap::new();
        for tool in inner.tools.values() {
            *counts.entry(tool.stage).or_insert(0) += 1;
        }
        counts
    }

    pub async fn has_pending_tools(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.tools.values().any(|t| !t.stage.is_terminal())
    }

    pub async fn pending_approval_count(&self) -> usize {
        self.inner.lock().await.pending_approval_count
    }

    /// `CanExecute` (`spec.md` §4.1): rejects when the batch is already at
    /// capacity or the same `(tool_name, canonical(args))` has recurred
    /// `>= max_repeated_calls` times in this batch.
    pub async fn can_execute(
        &self,
        tool_name: &str,
        tool_args: &serde_json::Value,
    ) -> (bool, Option<String>) {
        if tool_name.is_empty() {
            return (false, Some("tool name is required".to_string()));
        }

        let inner = self.inner.lock().await;
        if inner.tools.len() >= self.max_tools_per_turn {
            return (
                false,
                Some(format!(
                    "maximum tools per turn exceeded ({})",
                    self.max_tools_per_turn
                )),
            );
        }

        let key = call_key(tool_name, tool_args);
        let call_count = inner.call_history.get(&key).copied().unwrap_or(0);
        if call_count >= self.max_repeated_calls {
            return (
                false,
                Some(format!(
                    "tool '{tool_name}' called too many times with same arguments ({})",
                    self.max_repeated_calls
                )),
            );
        }

        (true, None)
    }

    /// `record_tool_call` (`spec.md` §4.2's duplicate-call suppression):
    /// increments the call-history count and returns the pre-increment
    /// count, so callers can decide "this was already at the limit" without
    /// a separate read-then-write race.
    pub async fn record_tool_call(&self, tool_name: &str, tool_args: &serde_json::Value) -> u32 {
        let key = call_key(tool_name, tool_args);
        let mut inner = self.inner.lock().await;
        let count = inner.call_history.entry(key).or_insert(0);
        let pre = *count;
        *count += 1;
        pre
    }
}
