//! End-to-end scenarios S2-S6 (`spec.md` §8). S1 is covered inline in
//! `conclave-core/src/manager/mod.rs`'s unit tests.

use std::collections::HashSet;
use std::sync::Arc;

use conclave_core::testing::{EchoTaskCatalog, GeneratorResponse, KeyedGenerator, MapToolExecutor};
use conclave_core::{AgentManager, Config};
use conclave_types::{AgentId, ApprovalDecision, Message, MessagePayload, SessionId, ToolCallId, ToolResult};
use futures::StreamExt;

fn client_message(session: &SessionId, payload: MessagePayload) -> Message {
    Message::new(AgentId::new("client"), session.clone(), payload)
}

/// S2 - a single auto-approved tool runs without any approval round trip.
#[tokio::test]
async fn s2_single_auto_approved_tool() {
    let generator = KeyedGenerator::new()
        .on_call(1, GeneratorResponse::tool_calls(vec![("1", "calc", serde_json::json!({"x": 1}))]))
        .on_call(2, GeneratorResponse::text("Result: 2"));
    let executor = MapToolExecutor::new()
        .with_tool("calc", |call| ToolResult::success(call.id.clone(), "calc", serde_json::json!("2")));

    let manager = AgentManager::spawn(
        Arc::new(generator),
        Arc::new(executor),
        None,
        Box::new(EchoTaskCatalog::new::<[(&str, &str); 0], &str, &str>([])),
        Config::default(),
        vec!["calc".to_string()],
        vec![],
    );

    let session = SessionId::new("s2");
    manager.register_session(session.clone()).await;
    manager
        .submit(client_message(&session, MessagePayload::User { content: "compute".to_string() }))
        .await
        .unwrap();

    let messages: Vec<Message> = manager.stream_session(session).await.unwrap().collect().await;

    assert!(matches!(messages[0].payload, MessagePayload::Thinking { .. }));
    assert!(messages
        .iter()
        .any(|m| matches!(&m.payload, MessagePayload::ToolCall { tool_calls } if tool_calls.len() == 1)));
    assert!(messages
        .iter()
        .any(|m| matches!(&m.payload, MessagePayload::ToolStarted { tool_name, .. } if tool_name == "calc")));
    let last = messages.last().unwrap();
    assert!(matches!(&last.payload, MessagePayload::Agent { content, is_final: true, .. } if content == "Result: 2"));

    manager.shutdown().await;
}

/// S3 - a rejected tool surfaces as a `ToolError` with the user's feedback.
#[tokio::test]
async fn s3_rejected_tool_carries_feedback_into_tool_error() {
    let generator = KeyedGenerator::new()
        .on_call(
            1,
            GeneratorResponse::tool_calls(vec![("1", "write_file", serde_json::json!({"path": "x"}))]),
        )
        .on_call(2, GeneratorResponse::text("Understood."));
    let executor = MapToolExecutor::new().with_tool("write_file", |call| {
        ToolResult::success(call.id.clone(), "write_file", serde_json::Value::Null)
    });

    let mut config = Config::default();
    config.require_tool_approval = true;

    let manager = AgentManager::spawn(
        Arc::new(generator),
        Arc::new(executor),
        None,
        Box::new(EchoTaskCatalog::new::<[(&str, &str); 0], &str, &str>([])),
        config,
        vec!["write_file".to_string()],
        vec![],
    );

    let session = SessionId::new("s3");
    manager.register_session(session.clone()).await;
    manager
        .submit(client_message(&session, MessagePayload::User { content: "write it".to_string() }))
        .await
        .unwrap();

    let mut stream = Box::pin(manager.stream_session(session.clone()).await.unwrap());
    let mut seen = Vec::new();
    loop {
        let message = stream.next().await.expect("stream ended before final message");
        if let MessagePayload::ApprovalRequest { tool_id, .. } = &message.payload {
            let tool_id = tool_id.clone();
            seen.push(message);
            manager
                .submit(client_message(
                    &session,
                    MessagePayload::ApprovalResponse {
                        tool_id,
                        decision: ApprovalDecision::Rejected,
                        feedback: Some("no".to_string()),
                    },
                ))
                .await
                .unwrap();
            continue;
        }
        let done = message.is_final_agent_message();
        seen.push(message);
        if done {
            break;
        }
    }

    assert!(seen.iter().any(|m| matches!(&m.payload, MessagePayload::ApprovalRequest { tool_id, .. } if tool_id == &ToolCallId::new("1"))));
    let tool_error = seen
        .iter()
        .find(|m| matches!(m.payload, MessagePayload::ToolError { .. }))
        .expect("expected a ToolError for the rejected tool");
    match &tool_error.payload {
        MessagePayload::ToolError { error_type, .. } => {
            assert_eq!(*error_type, Some(conclave_types::ToolErrorKind::UserRejected));
        }
        _ => unreachable!(),
    }
    let last = seen.last().unwrap();
    assert!(matches!(&last.payload, MessagePayload::Agent { content, is_final: true, .. } if content == "Understood."));

    manager.shutdown().await;
}

/// S4 - two tools in one batch, one auto-approved and one requiring approval.
#[tokio::test]
async fn s4_parallel_approvals_both_start_before_either_terminates() {
    let generator = KeyedGenerator::new()
        .on_call(
            1,
            GeneratorResponse::tool_calls(vec![
                ("a", "calc", serde_json::json!({})),
                ("b", "write_file", serde_json::json!({})),
            ]),
        )
        .on_call(2, GeneratorResponse::text("Done"));
    let executor = MapToolExecutor::new()
        .with_tool("calc", |call| ToolResult::success(call.id.clone(), "calc", serde_json::json!("ok")))
        .with_tool("write_file", |call| {
            ToolResult::success(call.id.clone(), "write_file", serde_json::Value::Null)
        });

    let mut config = Config::default();
    config.require_tool_approval = true;
    config.auto_approve_tools = HashSet::from(["calc".to_string()]);

    let manager = AgentManager::spawn(
        Arc::new(generator),
        Arc::new(executor),
        None,
        Box::new(EchoTaskCatalog::new::<[(&str, &str); 0], &str, &str>([])),
        config,
        vec!["calc".to_string(), "write_file".to_string()],
        vec![],
    );

    let session = SessionId::new("s4");
    manager.register_session(session.clone()).await;
    manager
        .submit(client_message(&session, MessagePayload::User { content: "go".to_string() }))
        .await
        .unwrap();

    let mut stream = Box::pin(manager.stream_session(session.clone()).await.unwrap());
    let mut seen = Vec::new();
    loop {
        let message = stream.next().await.expect("stream ended before final message");
        if let MessagePayload::ApprovalRequest { tool_id, .. } = &message.payload {
            let tool_id = tool_id.clone();
            seen.push(message);
            manager
                .submit(client_message(
                    &session,
                    MessagePayload::ApprovalResponse {
                        tool_id,
                        decision: ApprovalDecision::Approved,
                        feedback: None,
                    },
                ))
                .await
                .unwrap();
            continue;
        }
        let done = message.is_final_agent_message();
        seen.push(message);
        if done {
            break;
        }
    }

    assert!(!seen.iter().any(|m| matches!(&m.payload, MessagePayload::ApprovalRequest { tool_id, .. } if tool_id == &ToolCallId::new("a"))));
    assert!(seen.iter().any(|m| matches!(&m.payload, MessagePayload::ApprovalRequest { tool_id, .. } if tool_id == &ToolCallId::new("b"))));

    let started_a = seen
        .iter()
        .position(|m| matches!(&m.payload, MessagePayload::ToolStarted { tool_id, .. } if tool_id == &ToolCallId::new("a")))
        .expect("a should have started");
    let started_b = seen
        .iter()
        .position(|m| matches!(&m.payload, MessagePayload::ToolStarted { tool_id, .. } if tool_id == &ToolCallId::new("b")))
        .expect("b should have started");
    assert!(started_a < seen.len());
    assert!(started_b < seen.len());

    let last = seen.last().unwrap();
    assert!(matches!(&last.payload, MessagePayload::Agent { content, is_final: true, .. } if content == "Done"));

    manager.shutdown().await;
}

/// S5 - `execute_task` dispatches to the task agent and the meta agent only
/// completes once the task agent's final reply flows back through the FIFO.
#[tokio::test]
async fn s5_execute_task_dispatch_round_trip() {
    let generator = KeyedGenerator::new()
        .on_call(
            1,
            GeneratorResponse::tool_calls(vec![(
                "1",
                "execute_task",
                serde_json::json!({"task_id": "T", "input_values": {}}),
            )]),
        )
        .on_call(2, GeneratorResponse::text("42"))
        .on_call(3, GeneratorResponse::text("Task result: 42"));

    let manager = AgentManager::spawn(
        Arc::new(generator),
        Arc::new(MapToolExecutor::new()),
        None,
        Box::new(EchoTaskCatalog::new([("T", "do the thing")])),
        Config::default(),
        vec![],
        vec![],
    );

    let session = SessionId::new("s5");
    manager.register_session(session.clone()).await;
    manager
        .submit(client_message(&session, MessagePayload::User { content: "delegate".to_string() }))
        .await
        .unwrap();

    let messages: Vec<Message> = manager.stream_session(session).await.unwrap().collect().await;

    let meta_id = AgentId::new("METAGEN");
    let task_id = AgentId::new("TASK_AGENT_1");

    let tool_started_idx = messages
        .iter()
        .position(|m| {
            m.agent_id == meta_id
                && matches!(&m.payload, MessagePayload::ToolStarted { tool_name, .. } if tool_name == "execute_task")
        })
        .expect("meta agent should start execute_task");
    let first_task_event_idx = messages
        .iter()
        .position(|m| m.agent_id == task_id)
        .expect("task agent should emit at least one event");
    assert!(tool_started_idx < first_task_event_idx);

    let last = messages.last().unwrap();
    assert_eq!(last.agent_id, meta_id);
    assert!(matches!(&last.payload, MessagePayload::Agent { content, is_final: true, .. } if content == "Task result: 42"));

    manager.shutdown().await;
}

/// S6 - hitting `max_iterations` still completes the turn, with an `Error`
/// message marking the forced exit.
#[tokio::test]
async fn s6_iteration_limit_still_completes_the_turn() {
    let generator = KeyedGenerator::new()
        .on_call(1, GeneratorResponse::tool_calls(vec![("1", "calc", serde_json::json!({"x": 1}))]))
        .on_call(2, GeneratorResponse::tool_calls(vec![("2", "calc", serde_json::json!({"x": 2}))]));
    let executor = MapToolExecutor::new()
        .with_tool("calc", |call| ToolResult::success(call.id.clone(), "calc", serde_json::json!("ok")));

    let mut config = Config::default();
    config.max_iterations = 2;

    let manager = AgentManager::spawn(
        Arc::new(generator),
        Arc::new(executor),
        None,
        Box::new(EchoTaskCatalog::new::<[(&str, &str); 0], &str, &str>([])),
        config,
        vec!["calc".to_string()],
        vec![],
    );

    let session = SessionId::new("s6");
    manager.register_session(session.clone()).await;
    manager
        .submit(client_message(&session, MessagePayload::User { content: "loop".to_string() }))
        .await
        .unwrap();

    // The agent never emits a final `Agent` message in this scenario, so the
    // stream never terminates on its own; collect until the `Error` arrives.
    let mut stream = Box::pin(manager.stream_session(session).await.unwrap());
    let mut seen = Vec::new();
    loop {
        let message = stream.next().await.expect("stream ended before the iteration-limit error");
        let is_limit_error = matches!(&message.payload, MessagePayload::Error { error, .. } if error == "maximum iterations reached");
        seen.push(message);
        if is_limit_error {
            break;
        }
    }

    let tool_call_batches = seen
        .iter()
        .filter(|m| matches!(m.payload, MessagePayload::ToolCall { .. }))
        .count();
    assert_eq!(tool_call_batches, 2);
    let started = seen
        .iter()
        .filter(|m| matches!(m.payload, MessagePayload::ToolStarted { .. }))
        .count();
    assert_eq!(started, 2);

    manager.shutdown().await;
}
