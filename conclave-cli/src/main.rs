mod cli;
mod generator;
mod tasks;
mod tools;

use std::sync::Arc;

use clap::Parser;
use conclave_core::{AgentManager, Config};
use conclave_types::{ApprovalDecision, Message, MessagePayload, SessionId};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use cli::Args;
use generator::TerminalGenerator;
use tasks::EmptyTaskCatalog;
use tools::TerminalToolExecutor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Config::from_toml_str(&raw)?
        }
        None => Config::default(),
    };
    if args.require_approval {
        config.require_tool_approval = true;
    }

    let manager = AgentManager::spawn(
        Arc::new(TerminalGenerator::new()),
        Arc::new(TerminalToolExecutor),
        None,
        Box::new(EmptyTaskCatalog),
        config,
        vec!["current_time".to_string()],
        vec![],
    );

    let session_id = SessionId::new(args.session.clone());
    manager.register_session(session_id.clone()).await;

    println!("Conclave terminal session '{}'. Type 'exit' to quit.", args.session);

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        print!("> ");
        use std::io::Write as _;
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            break;
        }

        manager
            .submit(Message::new(
                conclave_types::AgentId::new("terminal"),
                session_id.clone(),
                MessagePayload::User { content: line },
            ))
            .await?;

        let mut stream = Box::pin(manager.stream_session(session_id.clone()).await?);
        while let Some(message) = stream.next().await {
            if !render(&message) {
                continue;
            }
            if let MessagePayload::ApprovalRequest { tool_id, tool_name, tool_args } = &message.payload {
                print!("approve {tool_name}({tool_args}) [y/N]? ");
                std::io::stdout().flush().ok();
                let decision = match lines.next_line().await? {
                    Some(reply) if reply.trim().eq_ignore_ascii_case("y") => ApprovalDecision::Approved,
                    _ => ApprovalDecision::Rejected,
                };
                manager
                    .submit(Message::new(
                        conclave_types::AgentId::new("terminal"),
                        session_id.clone(),
                        MessagePayload::ApprovalResponse { tool_id: tool_id.clone(), decision, feedback: None },
                    ))
                    .await?;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// Prints one routed message to the terminal. Returns `true` if the message
/// warrants further handling by the caller (currently only `ApprovalRequest`).
fn render(message: &Message) -> bool {
    match &message.payload {
        MessagePayload::Thinking { content } => {
            println!("[{}] {content}", message.agent_id);
            false
        }
        MessagePayload::Agent { content, is_final } => {
            println!("[{}]{} {content}", message.agent_id, if *is_final { "" } else { " (partial)" });
            false
        }
        MessagePayload::ToolStarted { tool_name, .. } => {
            println!("[{}] running {tool_name}...", message.agent_id);
            false
        }
        MessagePayload::ToolResult { tool_name, result, .. } => {
            println!("[{}] {tool_name} -> {result}", message.agent_id);
            false
        }
        MessagePayload::ToolError { tool_name, error, .. } => {
            println!("[{}] {tool_name} failed: {error}", message.agent_id);
            false
        }
        MessagePayload::Error { error, .. } => {
            println!("[{}] error: {error}", message.agent_id);
            false
        }
        MessagePayload::ApprovalRequest { .. } => true,
        _ => false,
    }
}
