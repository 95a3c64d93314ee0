//! Shared deterministic types for conversation control.
//!
//! These types define stable contracts between the runner, the backends, and
//! the IPC wire. They should not depend on external state or I/O and must
//! remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution state of a conversation, as reported by the agent side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Paused,
    WaitingForConfirmation,
    Finished,
    Error,
}

impl AgentStatus {
    /// Terminal statuses end the step loop.
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStatus::Finished | AgentStatus::Error)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Running => "running",
            AgentStatus::Paused => "paused",
            AgentStatus::WaitingForConfirmation => "waiting for confirmation",
            AgentStatus::Finished => "finished",
            AgentStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Risk level assigned to a pending action by the security analyzer.
///
/// `Unknown` orders above `High` so unanalyzed actions always require
/// confirmation under a risk-threshold policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityRisk {
    Low,
    Medium,
    High,
    Unknown,
}

impl fmt::Display for SecurityRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SecurityRisk::Low => "low",
            SecurityRisk::Medium => "medium",
            SecurityRisk::High => "high",
            SecurityRisk::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// A proposed tool call awaiting resolution.
///
/// Closed set of action shapes; risk is resolved at construction time, never
/// probed from the action afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingAction {
    /// Shell command proposed for execution.
    Command {
        command: String,
        risk: Option<SecurityRisk>,
    },
    /// File modification, summarized for display.
    FileEdit {
        path: String,
        summary: String,
        risk: Option<SecurityRisk>,
    },
    /// Any other tool call, carried opaquely.
    Generic {
        tool: String,
        payload: String,
        risk: Option<SecurityRisk>,
    },
}

impl PendingAction {
    pub fn tool_name(&self) -> &str {
        match self {
            PendingAction::Command { .. } => "shell",
            PendingAction::FileEdit { .. } => "file_edit",
            PendingAction::Generic { tool, .. } => tool,
        }
    }

    /// One-line description shown in confirmation prompts.
    pub fn summary(&self) -> String {
        match self {
            PendingAction::Command { command, .. } => command.clone(),
            PendingAction::FileEdit { path, summary, .. } => format!("{path}: {summary}"),
            PendingAction::Generic { payload, .. } => payload.clone(),
        }
    }

    pub fn risk(&self) -> Option<SecurityRisk> {
        match self {
            PendingAction::Command { risk, .. }
            | PendingAction::FileEdit { risk, .. }
            | PendingAction::Generic { risk, .. } => *risk,
        }
    }
}

/// Outcome of one confirmation round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationDecision {
    /// Execute the pending actions.
    Accept,
    /// Resolve the pending actions as rejected, with operator feedback.
    Reject { reason: String },
    /// Decide nothing; actions stay pending.
    Defer,
    /// Accept and disable confirmation mode for the rest of the session.
    AlwaysAccept,
}

/// Snapshot returned by `get_status` on every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub agent_status: AgentStatus,
    pub confirmation_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_risk_orders_above_high() {
        assert!(SecurityRisk::Unknown > SecurityRisk::High);
        assert!(SecurityRisk::High > SecurityRisk::Medium);
        assert!(SecurityRisk::Medium > SecurityRisk::Low);
    }

    #[test]
    fn agent_status_serializes_snake_case() {
        let json = serde_json::to_string(&AgentStatus::WaitingForConfirmation).expect("serialize");
        assert_eq!(json, "\"waiting_for_confirmation\"");
    }

    #[test]
    fn pending_action_round_trips_with_kind_tag() {
        let action = PendingAction::Command {
            command: "rm -rf build".to_string(),
            risk: Some(SecurityRisk::High),
        };
        let json = serde_json::to_string(&action).expect("serialize");
        assert!(json.contains("\"kind\":\"command\""), "json: {json}");
        let back: PendingAction = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, action);
    }

    #[test]
    fn accessors_cover_every_shape() {
        let edit = PendingAction::FileEdit {
            path: "src/main.rs".to_string(),
            summary: "replace entry point".to_string(),
            risk: None,
        };
        assert_eq!(edit.tool_name(), "file_edit");
        assert_eq!(edit.summary(), "src/main.rs: replace entry point");
        assert_eq!(edit.risk(), None);

        let generic = PendingAction::Generic {
            tool: "browser".to_string(),
            payload: "open https://example.com".to_string(),
            risk: Some(SecurityRisk::Low),
        };
        assert_eq!(generic.tool_name(), "browser");
        assert_eq!(generic.risk(), Some(SecurityRisk::Low));
    }
}
