//! The tool flow sub-protocol (`spec.md` §4.3).

use std::sync::Arc;
use std::time::Duration;

use conclave_types::{
    AgentId, Message, MessagePayload, SessionId, ToolCall, ToolCallId, ToolErrorKind, ToolResult,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::policy::ApprovalPolicy;
use crate::agent::task_interceptor::TaskInterceptor;
use crate::interfaces::{MemoryStore, ToolExecutor};
use crate::tool::{ToolStage, ToolTracker, TrackedTool, StageUpdate};

/// One completed (or rejected) tool call fed back to the generator as
/// `prev_tool_calls`/`prev_tool_results` (`spec.md` §4.3 step 7).
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub call: ToolCall,
    pub result: ToolResult,
}

pub struct ToolFlowContext<'a> {
    pub agent_id: &'a AgentId,
    pub session_id: &'a SessionId,
    pub turn_id: &'a str,
    pub tool_executor: &'a Arc<dyn ToolExecutor>,
    pub memory_store: Option<&'a Arc<dyn MemoryStore>>,
    pub approval_policy: &'a ApprovalPolicy,
    pub task_interceptor: Option<&'a Arc<TaskInterceptor>>,
    pub max_tools_per_turn: usize,
    pub max_repeated_calls: u32,
    pub show_tool_results: bool,
    pub approval_timeout: Duration,
    pub cancellation: &'a CancellationToken,
}

/// Runs steps 1-7 of `spec.md` §4.3 over one batch of tool calls.
///
/// `output` receives `ApprovalRequest`/`ToolStarted`/`ToolResult`/`ToolError`
/// messages as they occur. `mailbox` is drained for `ApprovalResponse`
/// messages while waiting on pending approvals — it is the same mailbox the
/// owning agent reads user messages from, per `spec.md` §4.3 step 4.
pub async fn run_tool_flow(
    ctx: &ToolFlowContext<'_>,
    calls: Vec<ToolCall>,
    output: &mpsc::UnboundedSender<Message>,
    mailbox: &mut mpsc::UnboundedReceiver<Message>,
) -> Vec<ToolExecution> {
    let tracker = ToolTracker::new(
        Some(ctx.agent_id.clone()),
        ctx.max_tools_per_turn,
        ctx.max_repeated_calls,
        ctx.memory_store.cloned(),
    );

    // Step 2: classify each call and add it to a fresh tracker.
    for call in &calls {
        let is_known = ctx.tool_executor.knows_tool(&call.name)
            || matches!(ctx.task_interceptor, Some(_) if call.name == "execute_task");
        let (within_limits, limit_reason) = tracker.can_execute(&call.name, &call.arguments).await;

        let (stage, error) = if !is_known {
            (ToolStage::Rejected, Some("tool not found".to_string()))
        } else if !within_limits {
            (ToolStage::Rejected, Some(limit_reason.unwrap_or_else(|| "too many identical calls".to_string())))
        } else if ctx.approval_policy.requires_approval(
            &call.name,
            &crate::tool::canonicalize_args(&call.arguments),
        ) {
            (ToolStage::PendingApproval, None)
        } else {
            (ToolStage::Approved, None)
        };

        tracker.record_tool_call(&call.name, &call.arguments).await;

        let mut tracked = TrackedTool::new(call.id.clone(), call.name.clone(), call.arguments.clone(), stage)
            .with_agent_id(ctx.agent_id.clone())
            .with_turn_id(ctx.turn_id.to_string());
        if stage == ToolStage::Rejected {
            tracked.error_kind = Some(ToolErrorKind::InvalidArgs);
        }
        tracked.error = error;
        tracker.add_tool(tracked).await;
    }

    // Step 3/4: emit approval requests and wait for them all to resolve.
    let pending = tracker.get_pending_approvals().await;
    if !pending.is_empty() {
        for tool in &pending {
            let _ = output.send(Message::new(
                ctx.agent_id.clone(),
                ctx.session_id.clone(),
                MessagePayload::ApprovalRequest {
                    tool_id: tool.tool_id.clone(),
                    tool_name: tool.tool_name.clone(),
                    tool_args: tool.tool_args.clone(),
                },
            ));
        }

        wait_for_approvals_or_timeout(ctx, &tracker, output, mailbox).await;
    }

    // Step 5: execute everything now approved.
    let approved = tracker.get_tools_by_stage(ToolStage::Approved).await;
    for tool in &approved {
        let _ = output.send(Message::new(
            ctx.agent_id.clone(),
            ctx.session_id.clone(),
            MessagePayload::ToolStarted {
                tool_id: tool.tool_id.clone(),
                tool_name: tool.tool_name.clone(),
            },
        ));
        tracker
            .update_stage(&tool.tool_id, ToolStage::Executing, StageUpdate::default())
            .await
            .ok();

        let call = ToolCall::new(tool.tool_id.clone(), tool.tool_name.clone(), tool.tool_args.clone());
        let result = execute_one(ctx, &call).await;

        let next_stage = if result.is_error { ToolStage::Failed } else { ToolStage::Completed };
        tracker
            .update_stage(
                &tool.tool_id,
                next_stage,
                StageUpdate {
                    result: Some(result.clone()),
                    error: result.error.clone(),
                    ..Default::default()
                },
            )
            .await
            .ok();

        emit_outcome(ctx, output, &tool.tool_id, &tool.tool_name, &result);
    }

    // Step 6: build executions, including synthesized results for rejected tools.
    let mut executions = Vec::with_capacity(calls.len());
    for tool in tracker.get_all_tools().await {
        let call = ToolCall::new(tool.tool_id.clone(), tool.tool_name.clone(), tool.tool_args.clone());
        let result = match tool.stage {
            ToolStage::Completed | ToolStage::Failed => tool
                .result
                .clone()
                .unwrap_or_else(|| failure_result(&tool.tool_id, &tool.tool_name, "missing result", ToolErrorKind::ExecutionError)),
            ToolStage::Rejected => {
                // System-initiated rejections (unknown tool, over a limit,
                // timed out, cancelled) stamp `error_kind` at the point of
                // rejection; a bare `ApprovalResponse` rejection from the
                // user leaves it unset.
                let error_type = tool.error_kind.unwrap_or(ToolErrorKind::UserRejected);
                // `expire_pending` already announced timeout/cancellation
                // rejections to the output stream; don't send a second
                // `ToolError` for them here.
                let already_announced = matches!(tool.error.as_deref(), Some("approval timeout") | Some("cancelled"));
                let message = tool.error.clone().unwrap_or_else(|| "rejected".to_string());
                let mut result = failure_result(&tool.tool_id, &tool.tool_name, message, error_type);
                if let Some(feedback) = &tool.user_feedback {
                    result = result.with_user_display(feedback.clone());
                }
                if !already_announced {
                    emit_outcome(ctx, output, &tool.tool_id, &tool.tool_name, &result);
                }
                result
            }
            // Approved/Executing/PendingApproval should not remain at this point.
            _ => continue,
        };
        executions.push(ToolExecution { call, result });
    }

    executions
}

async fn execute_one(ctx: &ToolFlowContext<'_>, call: &ToolCall) -> ToolResult {
    if call.name == "execute_task" {
        if let Some(interceptor) = ctx.task_interceptor {
            return interceptor.dispatch(call, ctx.session_id).await;
        }
    }
    ctx.tool_executor.execute(call).await
}

fn emit_outcome(
    ctx: &ToolFlowContext<'_>,
    output: &mpsc::UnboundedSender<Message>,
    tool_id: &ToolCallId,
    tool_name: &str,
    result: &ToolResult,
) {
    if result.is_error {
        let _ = output.send(Message::new(
            ctx.agent_id.clone(),
            ctx.session_id.clone(),
            MessagePayload::ToolError {
                tool_id: tool_id.clone(),
                tool_name: tool_name.to_string(),
                error: result.error.clone().unwrap_or_default(),
                error_type: result.error_type,
            },
        ));
    } else if ctx.show_tool_results {
        let _ = output.send(Message::new(
            ctx.agent_id.clone(),
            ctx.session_id.clone(),
            MessagePayload::ToolResult {
                tool_id: tool_id.clone(),
                tool_name: tool_name.to_string(),
                result: result.content.clone(),
            },
        ));
    }
}

fn failure_result(
    tool_id: &ToolCallId,
    tool_name: &str,
    message: impl Into<String>,
    kind: ToolErrorKind,
) -> ToolResult {
    ToolResult::failure(tool_id.clone(), tool_name.to_string(), message, kind)
}

/// Step 4's wait: drains `ApprovalResponse` messages from the mailbox until
/// every pending tool resolves, the approval timeout elapses, or the agent is
/// cancelled (`spec.md` §4.3 cancellation semantics, §4.5 timeout).
async fn wait_for_approvals_or_timeout(
    ctx: &ToolFlowContext<'_>,
    tracker: &ToolTracker,
    output: &mpsc::UnboundedSender<Message>,
    mailbox: &mut mpsc::UnboundedReceiver<Message>,
) {
    // A fixed deadline, not a sleep re-armed on every loop iteration — mailbox
    // traffic while tools are pending must not push the timeout back.
    let deadline = tokio::time::sleep(ctx.approval_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = tracker.wait_for_approvals() => return,
            () = &mut deadline => {
                expire_pending(ctx, tracker, output, "approval timeout").await;
                return;
            }
            () = ctx.cancellation.cancelled() => {
                expire_pending(ctx, tracker, output, "cancelled").await;
                return;
            }
            received = mailbox.recv() => {
                match received {
                    Some(Message { payload: MessagePayload::ApprovalResponse { tool_id, decision, feedback }, .. }) => {
                        let new_stage = match decision {
                            conclave_types::ApprovalDecision::Approved => ToolStage::Approved,
                            conclave_types::ApprovalDecision::Rejected => ToolStage::Rejected,
                        };
                        if let Err(err) = tracker
                            .update_stage(&tool_id, new_stage, StageUpdate { user_feedback: feedback, ..Default::default() })
                            .await
                        {
                            warn!(%tool_id, %err, "late or invalid approval response ignored");
                        }
                    }
                    Some(other) => warn!(?other, "unexpected message while waiting for tool approvals"),
                    None => {
                        info!("agent mailbox closed while waiting for approvals");
                        return;
                    }
                }
            }
        }
    }
}

async fn expire_pending(
    ctx: &ToolFlowContext<'_>,
    tracker: &ToolTracker,
    output: &mpsc::UnboundedSender<Message>,
    reason: &str,
) {
    let error_type = if reason == "approval timeout" { ToolErrorKind::Timeout } else { ToolErrorKind::InvalidArgs };
    for tool in tracker.get_pending_approvals().await {
        if tracker
            .update_stage(
                &tool.tool_id,
                ToolStage::Rejected,
                StageUpdate {
                    error: Some(reason.to_string()),
                    error_kind: Some(error_type),
                    ..Default::default()
                },
            )
            .await
            .is_ok()
        {
            let _ = output.send(Message::new(
                ctx.agent_id.clone(),
                ctx.session_id.clone(),
                MessagePayload::ToolError {
                    tool_id: tool.tool_id.clone(),
                    tool_name: tool.tool_name.clone(),
                    error: reason.to_string(),
                    error_type: Some(error_type),
                },
            ));
        }
    }
}
