//! `ConversationTurn` (`spec.md` §3).

use chrono::{DateTime, Utc};
use conclave_types::AgentId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    InProgress,
    Completed,
    Error,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub agent_id: AgentId,
    pub turn_number: u64,
    pub timestamp: DateTime<Utc>,
    pub user_query: String,
    pub agent_response: String,
    pub tools_used: bool,
    pub status: TurnStatus,
    pub trace_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: Option<u64>,
    pub error_details: Option<String>,
    pub compacted: bool,
}

impl ConversationTurn {
    pub fn start(id: String, agent_id: AgentId, turn_number: u64, user_query: String) -> Self {
        Self {
            id,
            agent_id,
            turn_number,
            timestamp: Utc::now(),
            user_query,
            agent_response: String::new(),
            tools_used: false,
            status: TurnStatus::InProgress,
            trace_id: None,
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: None,
            error_details: None,
            compacted: false,
        }
    }
}

/// Assigns monotonically increasing, gap-free turn numbers per agent
/// (`spec.md` §8 invariant 3).
#[derive(Debug, Default)]
pub struct TurnCounter {
    counters: std::collections::HashMap<AgentId, u64>,
}

impl TurnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, agent_id: &AgentId) -> u64 {
        let counter = self.counters.entry(agent_id.clone()).or_insert(0);
        *counter += 1;
        *counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_numbers_are_monotone_per_agent_and_independent_across_agents() {
        let mut counter = TurnCounter::new();
        let meta = AgentId::new("METAGEN");
        let task = AgentId::new("TASK_AGENT_1");

        assert_eq!(counter.next(&meta), 1);
        assert_eq!(counter.next(&meta), 2);
        assert_eq!(counter.next(&task), 1);
        assert_eq!(counter.next(&meta), 3);
    }
}
