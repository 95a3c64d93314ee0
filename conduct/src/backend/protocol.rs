//! Wire format for the process backend.
//!
//! Messages are newline-delimited JSON. The protocol is strictly serial: one
//! command is answered by exactly one response before the next command is
//! sent, so responses can never interleave.

use serde::{Deserialize, Serialize};

use crate::core::types::AgentStatus;

/// Commands the parent sends over the worker's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ProcessCommand {
    ProcessMessage { message: Option<String> },
    Pause,
    Resume,
    ToggleConfirmation,
    GetStatus,
    Shutdown,
}

/// Responses the worker writes to its stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessResponse {
    Success {
        message: String,
    },
    Error {
        message: String,
    },
    Status {
        agent_status: AgentStatus,
        confirmation_mode: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_serialize_with_tag() {
        let json = serde_json::to_string(&ProcessCommand::ProcessMessage {
            message: Some("hi".to_string()),
        })
        .expect("serialize");
        assert_eq!(json, r#"{"command":"process_message","message":"hi"}"#);

        let json = serde_json::to_string(&ProcessCommand::ToggleConfirmation).expect("serialize");
        assert_eq!(json, r#"{"command":"toggle_confirmation"}"#);
    }

    #[test]
    fn status_response_round_trips() {
        let response = ProcessResponse::Status {
            agent_status: AgentStatus::Paused,
            confirmation_mode: true,
        };
        let json = serde_json::to_string(&response).expect("serialize");
        assert_eq!(
            json,
            r#"{"type":"status","agent_status":"paused","confirmation_mode":true}"#
        );
        let back: ProcessResponse = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, response);
    }

    #[test]
    fn message_less_process_message_round_trips() {
        let command = ProcessCommand::ProcessMessage { message: None };
        let json = serde_json::to_string(&command).expect("serialize");
        let back: ProcessCommand = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, command);
    }
}
