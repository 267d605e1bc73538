//! Runtime configuration (`spec.md` §6, `SPEC_FULL.md` §6).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{CoreError, Result};

/// Options consumed by the core, enumerated in `spec.md` §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_iterations: u32,
    pub max_tools_per_turn: usize,
    pub max_repeated_calls: u32,
    pub require_tool_approval: bool,
    pub auto_approve_tools: HashSet<String>,
    pub approval_timeout_seconds: u64,
    pub show_tool_results: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_tools_per_turn: 100,
            max_repeated_calls: 3,
            require_tool_approval: false,
            auto_approve_tools: HashSet::new(),
            approval_timeout_seconds: 30,
            show_tool_results: true,
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn approval_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.approval_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.max_tools_per_turn, 100);
        assert_eq!(config.max_repeated_calls, 3);
        assert!(!config.require_tool_approval);
        assert_eq!(config.approval_timeout_seconds, 30);
        assert!(config.show_tool_results);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config = Config::from_toml_str("require_tool_approval = true\n").unwrap();
        assert!(config.require_tool_approval);
        assert_eq!(config.max_iterations, 50);
    }
}
