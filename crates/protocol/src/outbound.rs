//! Outbound consumer frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use bc_domain::message::{ContentBlock, PermissionRequest, ResultPayload};
use bc_domain::state::{CommandInfo, ModelInfo, QueuedMessage, SessionState};

use crate::{ConsumerRole, SequencedEvent};

/// Session activity as shown to consumers. `Watchdog` is broadcast while
/// the broker waits for a relaunched backend to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionActivity {
    Idle,
    Running,
    Compacting,
    Watchdog,
}

/// One connected consumer, as reported in `presence_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    pub role: ConsumerRole,
}

/// Everything the broker sends to a consumer. All variants are wrapped in a
/// [`SequencedMessage`](crate::SequencedMessage) on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsumerEvent {
    Identity {
        user_id: String,
        display_name: String,
        role: ConsumerRole,
    },
    SessionInit {
        state: SessionState,
    },
    SessionUpdate {
        state: SessionState,
    },
    Assistant {
        content: Vec<ContentBlock>,
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        metadata: serde_json::Map<String, Value>,
    },
    StreamEvent {
        event: Value,
    },
    Result(ResultPayload),
    PermissionRequest(PermissionRequest),
    PermissionCancelled {
        request_id: String,
    },
    ToolProgress {
        tool_call_id: String,
        progress: Value,
    },
    StatusChange {
        status: SessionActivity,
    },
    Error {
        kind: String,
        message: String,
    },
    CliConnected,
    CliDisconnected,
    MessageHistory {
        messages: Vec<SequencedEvent>,
    },
    PresenceUpdate {
        consumers: Vec<PresenceEntry>,
    },
    SlashCommandResult {
        command: String,
        #[serde(default)]
        request_id: Option<String>,
        content: String,
        source: String,
        duration_ms: u64,
    },
    SlashCommandError {
        command: String,
        #[serde(default)]
        request_id: Option<String>,
        error: String,
    },
    CapabilitiesReady {
        commands: Vec<CommandInfo>,
        models: Vec<ModelInfo>,
    },
    QueuedMessageUpdated {
        queued: QueuedMessage,
    },
    QueuedMessageCancelled,
}

impl ConsumerEvent {
    /// Critical messages bypass the high-water shed band of the per-consumer
    /// outbound queue. Closed set; everything else is droppable.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::PermissionRequest(_)
                | Self::PermissionCancelled { .. }
                | Self::Result(_)
                | Self::SessionInit { .. }
                | Self::Error { .. }
                | Self::CliDisconnected
                | Self::CliConnected
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Identity { .. } => "identity",
            Self::SessionInit { .. } => "session_init",
            Self::SessionUpdate { .. } => "session_update",
            Self::Assistant { .. } => "assistant",
            Self::StreamEvent { .. } => "stream_event",
            Self::Result(_) => "result",
            Self::PermissionRequest(_) => "permission_request",
            Self::PermissionCancelled { .. } => "permission_cancelled",
            Self::ToolProgress { .. } => "tool_progress",
            Self::StatusChange { .. } => "status_change",
            Self::Error { .. } => "error",
            Self::CliConnected => "cli_connected",
            Self::CliDisconnected => "cli_disconnected",
            Self::MessageHistory { .. } => "message_history",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::SlashCommandResult { .. } => "slash_command_result",
            Self::SlashCommandError { .. } => "slash_command_error",
            Self::CapabilitiesReady { .. } => "capabilities_ready",
            Self::QueuedMessageUpdated { .. } => "queued_message_updated",
            Self::QueuedMessageCancelled => "queued_message_cancelled",
        }
    }

    /// Wire error frame from a domain error.
    pub fn from_error(err: &bc_domain::Error) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_set_matches_spec() {
        assert!(ConsumerEvent::CliConnected.is_critical());
        assert!(ConsumerEvent::CliDisconnected.is_critical());
        assert!(ConsumerEvent::PermissionCancelled {
            request_id: "r".into()
        }
        .is_critical());
        assert!(ConsumerEvent::Error {
            kind: "x".into(),
            message: "y".into()
        }
        .is_critical());

        assert!(!ConsumerEvent::StreamEvent {
            event: Value::Null
        }
        .is_critical());
        assert!(!ConsumerEvent::PresenceUpdate {
            consumers: vec![]
        }
        .is_critical());
        assert!(!ConsumerEvent::StatusChange {
            status: SessionActivity::Running
        }
        .is_critical());
    }

    #[test]
    fn tagged_serialization() {
        let event = ConsumerEvent::SlashCommandError {
            command: "/frobnicate".into(),
            request_id: None,
            error: "unsupported".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "slash_command_error");
        assert_eq!(json["command"], "/frobnicate");
    }
}
