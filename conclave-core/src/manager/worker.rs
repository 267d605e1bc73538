//! Per-agent worker supervision (`spec.md` §4.6, `SPEC_FULL.md` §4.6).
//!
//! Each worker wraps [`AgentLoop::run`] in a restart loop: a panic inside the
//! loop body, or a fatal `GeneratorError` re-raised out of it (`spec.md` §7),
//! increments a consecutive-error counter and backs off for
//! `min(60, 2^(n - max_consecutive_errors))` seconds once that counter
//! exceeds `max_consecutive_errors`, matching the original source's
//! `agent_manager.py` worker-recovery loop. A clean return from `run` (mailbox
//! closed, or cancellation observed) ends the worker without restarting.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use conclave_types::{Message, MessagePayload};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::agent::AgentLoop;

pub fn spawn_supervised(
    agent: Arc<AgentLoop>,
    mut mailbox: mpsc::UnboundedReceiver<Message>,
    output: mpsc::UnboundedSender<Message>,
    cancellation: CancellationToken,
    max_consecutive_errors: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut consecutive_errors: u32 = 0;
        loop {
            let run = AssertUnwindSafe(agent.run(&mut mailbox, output.clone(), cancellation.clone()))
                .catch_unwind();

            let reason = match run.await {
                Ok(Ok(())) => return,
                Ok(Err(err)) => {
                    error!(agent_id = %agent.agent_id, %err, "agent worker stopped on fatal generator error");
                    err.to_string()
                }
                Err(panic) => {
                    let reason = panic_message(&panic);
                    error!(agent_id = %agent.agent_id, %reason, "agent worker panicked");
                    reason
                }
            };

            consecutive_errors += 1;
            error!(agent_id = %agent.agent_id, consecutive_errors, %reason, "restarting agent worker");
            let _ = output.send(Message::new(
                agent.agent_id.clone(),
                conclave_types::SessionId::new("__worker__"),
                MessagePayload::Error {
                    error: "agent worker crashed".to_string(),
                    details: Some(reason),
                },
            ));

            if consecutive_errors > max_consecutive_errors {
                let backoff = 2u64.saturating_pow(consecutive_errors - max_consecutive_errors);
                tokio::time::sleep(Duration::from_secs(backoff.min(60))).await;
            }
        }
    })
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
