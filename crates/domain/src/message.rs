//! The canonical internal message envelope.
//!
//! Every backend adapter translates its wire protocol to and from
//! [`UnifiedMessage`]; everything downstream of the adapter (router, reducer,
//! broadcaster, persistence) speaks only this type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::SessionStatus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles & content blocks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[default]
    System,
    Tool,
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        /// Base64 payload.
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload variants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An MCP server advertised in `session_init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Metadata carried by the adapter's first message after connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionInitPayload {
    pub session_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServer>,
    #[serde(default)]
    pub slash_commands: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
}

/// Per-model token usage reported in a `result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Context window of the model; 0 when the adapter does not know it.
    #[serde(default)]
    pub context_window: u64,
}

/// End-of-turn result metadata from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub status: ResultStatus,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub num_turns: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub lines_added: u64,
    #[serde(default)]
    pub lines_removed: u64,
    #[serde(default)]
    pub usage: Vec<ModelUsage>,
}

impl ResultPayload {
    /// The synthetic result an adapter emits when its transport is lost.
    pub fn transport_failure(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            is_error: true,
            error: Some(error.into()),
            total_cost_usd: 0.0,
            num_turns: 0,
            duration_ms: 0,
            lines_added: 0,
            lines_removed: 0,
            usage: Vec::new(),
        }
    }
}

/// A permission request surfaced by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub input: Value,
    pub timestamp: DateTime<Utc>,
    /// Adapter-specific hints (suggestions, rule ids, …) passed through verbatim.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub hints: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

/// A consumer's reply to a pending permission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResponsePayload {
    pub request_id: String,
    pub behavior: PermissionBehavior,
    #[serde(default)]
    pub updated_input: Option<Value>,
    #[serde(default)]
    pub updated_permissions: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

/// The discriminated payload of a [`UnifiedMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnifiedPayload {
    SessionInit(SessionInitPayload),
    StatusChange {
        #[serde(default)]
        status: Option<SessionStatus>,
        #[serde(default)]
        permission_mode: Option<String>,
    },
    Result(ResultPayload),
    ControlResponse {
        request_id: String,
        success: bool,
        #[serde(default)]
        response: Value,
    },
    UserMessage,
    Interrupt,
    PermissionResponse(PermissionResponsePayload),
    ConfigurationChange {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        permission_mode: Option<String>,
    },
    StreamEvent {
        #[serde(default)]
        event: Value,
    },
    PermissionRequest(PermissionRequest),
    ToolProgress {
        tool_call_id: String,
        #[serde(default)]
        progress: Value,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The canonical internal envelope: a tagged payload plus the common
/// role / content / metadata fields every variant carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    #[serde(flatten)]
    pub payload: UnifiedPayload,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl UnifiedMessage {
    pub fn new(payload: UnifiedPayload, role: Role) -> Self {
        Self {
            payload,
            role,
            content: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// A plain user text message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            payload: UnifiedPayload::UserMessage,
            role: Role::User,
            content: vec![ContentBlock::text(text)],
            metadata: Map::new(),
        }
    }

    pub fn interrupt() -> Self {
        Self::new(UnifiedPayload::Interrupt, Role::User)
    }

    pub fn permission_response(response: PermissionResponsePayload) -> Self {
        Self::new(UnifiedPayload::PermissionResponse(response), Role::User)
    }

    pub fn configuration_change(model: Option<String>, permission_mode: Option<String>) -> Self {
        Self::new(
            UnifiedPayload::ConfigurationChange {
                model,
                permission_mode,
            },
            Role::User,
        )
    }

    /// The synthetic terminal message an adapter yields on transport loss.
    pub fn transport_failure(error: impl Into<String>) -> Self {
        Self::new(
            UnifiedPayload::Result(ResultPayload::transport_failure(error)),
            Role::System,
        )
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// The wire tag of the payload variant (for logs and metrics).
    pub fn type_name(&self) -> &'static str {
        match &self.payload {
            UnifiedPayload::SessionInit(_) => "session_init",
            UnifiedPayload::StatusChange { .. } => "status_change",
            UnifiedPayload::Result(_) => "result",
            UnifiedPayload::ControlResponse { .. } => "control_response",
            UnifiedPayload::UserMessage => "user_message",
            UnifiedPayload::Interrupt => "interrupt",
            UnifiedPayload::PermissionResponse(_) => "permission_response",
            UnifiedPayload::ConfigurationChange { .. } => "configuration_change",
            UnifiedPayload::StreamEvent { .. } => "stream_event",
            UnifiedPayload::PermissionRequest(_) => "permission_request",
            UnifiedPayload::ToolProgress { .. } => "tool_progress",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_round_trips() {
        let msg = UnifiedMessage::user("hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"user_message""#));
        assert!(json.contains(r#""role":"user""#));

        let back: UnifiedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.text(), "hello");
    }

    #[test]
    fn permission_request_tag() {
        let msg = UnifiedMessage::new(
            UnifiedPayload::PermissionRequest(PermissionRequest {
                request_id: "r1".into(),
                tool_name: "Bash".into(),
                tool_call_id: None,
                input: serde_json::json!({"command": "ls"}),
                timestamp: Utc::now(),
                hints: Map::new(),
            }),
            Role::System,
        );
        assert_eq!(msg.type_name(), "permission_request");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "permission_request");
        assert_eq!(json["tool_name"], "Bash");
    }

    #[test]
    fn transport_failure_is_failed_result() {
        let msg = UnifiedMessage::transport_failure("stream ended");
        match &msg.payload {
            UnifiedPayload::Result(r) => {
                assert_eq!(r.status, ResultStatus::Failed);
                assert!(r.is_error);
                assert_eq!(r.error.as_deref(), Some("stream ended"));
            }
            other => panic!("expected result payload, got {other:?}"),
        }
    }

    #[test]
    fn multi_block_text_concatenation() {
        let mut msg = UnifiedMessage::user("one");
        msg.content.push(ContentBlock::text("two"));
        assert_eq!(msg.text(), "one\ntwo");
    }
}
