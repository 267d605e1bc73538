//! Approval policy (`spec.md` §4.5).

use std::collections::HashSet;
use std::sync::RwLock;

use glob::Pattern;

/// Decides whether a given tool call requires user approval before it runs.
///
/// A tool requires approval iff `require_approval && name not in auto_approve_tools`.
/// Supplemental: a tool whose canonicalized argument string matches one of a set
/// of glob patterns is treated the same as an exact name match (grounded on the
/// teacher's `is_bash_pattern_approved` pre-approval check), and a tool name can
/// be durably approved at runtime for the remainder of the session.
pub struct ApprovalPolicy {
    require_approval: bool,
    auto_approve_names: RwLock<HashSet<String>>,
    auto_approve_arg_patterns: Vec<(String, Pattern)>,
}

impl ApprovalPolicy {
    pub fn new(require_approval: bool, auto_approve_tools: HashSet<String>) -> Self {
        Self {
            require_approval,
            auto_approve_names: RwLock::new(auto_approve_tools),
            auto_approve_arg_patterns: Vec::new(),
        }
    }

    /// Pre-approve calls to `tool_name` whose canonicalized arguments match `pattern`
    /// (e.g. `("shell", "git status*")`).
    pub fn with_arg_pattern(mut self, tool_name: impl Into<String>, pattern: &str) -> Self {
        if let Ok(pattern) = Pattern::new(pattern) {
            self.auto_approve_arg_patterns.push((tool_name.into(), pattern));
        }
        self
    }

    /// Durably approves every future call to `tool_name` for the rest of the session.
    pub fn approve_tool_name(&self, tool_name: &str) {
        self.auto_approve_names
            .write()
            .expect("auto_approve_names poisoned")
            .insert(tool_name.to_string());
    }

    pub fn requires_approval(&self, tool_name: &str, canonical_args: &str) -> bool {
        if !self.require_approval {
            return false;
        }
        if self
            .auto_approve_names
            .read()
            .expect("auto_approve_names poisoned")
            .contains(tool_name)
        {
            return false;
        }
        let pre_approved_by_pattern = self
            .auto_approve_arg_patterns
            .iter()
            .any(|(name, pattern)| name == tool_name && pattern.matches(canonical_args));
        !pre_approved_by_pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_name_exempts_from_approval() {
        let policy = ApprovalPolicy::new(true, HashSet::from(["calc".to_string()]));
        assert!(!policy.requires_approval("calc", "{}"));
        assert!(policy.requires_approval("write_file", "{}"));
    }

    #[test]
    fn approval_disabled_never_requires_approval() {
        let policy = ApprovalPolicy::new(false, HashSet::new());
        assert!(!policy.requires_approval("write_file", "{}"));
    }

    #[test]
    fn arg_pattern_pre_approves_matching_calls() {
        let policy = ApprovalPolicy::new(true, HashSet::new())
            .with_arg_pattern("shell", "*git status*");
        assert!(!policy.requires_approval("shell", "{\"cmd\":\"git status\"}"));
        assert!(policy.requires_approval("shell", "{\"cmd\":\"rm -rf /\"}"));
    }

    #[test]
    fn runtime_approval_is_durable() {
        let policy = ApprovalPolicy::new(true, HashSet::new());
        assert!(policy.requires_approval("write_file", "{}"));
        policy.approve_tool_name("write_file");
        assert!(!policy.requires_approval("write_file", "{}"));
    }
}
