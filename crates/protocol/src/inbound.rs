//! Inbound consumer frames.

use serde::{Deserialize, Serialize};

use bc_domain::error::{Error, Result};
use bc_domain::message::PermissionResponsePayload;

/// The closed set of frames a consumer may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsumerRequest {
    UserMessage {
        content: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        images: Vec<String>,
    },
    PermissionResponse(PermissionResponsePayload),
    Interrupt,
    SetModel {
        model: String,
    },
    SetPermissionMode {
        mode: String,
    },
    PresenceQuery,
    SlashCommand {
        command: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    SetAdapter {
        adapter: String,
    },
    QueueMessage {
        content: String,
        #[serde(default)]
        images: Vec<String>,
    },
    UpdateQueuedMessage {
        content: String,
        #[serde(default)]
        images: Vec<String>,
    },
    CancelQueuedMessage,
}

impl ConsumerRequest {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::PermissionResponse(_) => "permission_response",
            Self::Interrupt => "interrupt",
            Self::SetModel { .. } => "set_model",
            Self::SetPermissionMode { .. } => "set_permission_mode",
            Self::PresenceQuery => "presence_query",
            Self::SlashCommand { .. } => "slash_command",
            Self::SetAdapter { .. } => "set_adapter",
            Self::QueueMessage { .. } => "queue_message",
            Self::UpdateQueuedMessage { .. } => "update_queued_message",
            Self::CancelQueuedMessage => "cancel_queued_message",
        }
    }
}

/// Parse one inbound frame, distinguishing the three failure classes:
/// not JSON at all → `InvalidFrame`; JSON with an unrecognized `type` →
/// `UnknownMessageType`; a recognized `type` with bad fields →
/// `SchemaViolation`.
pub fn parse_request(raw: &str) -> Result<ConsumerRequest> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| Error::InvalidFrame(e.to_string()))?;

    match serde_json::from_value::<ConsumerRequest>(value.clone()) {
        Ok(request) => Ok(request),
        Err(e) => {
            let tag = value.get("type").and_then(|t| t.as_str());
            match tag {
                None => Err(Error::SchemaViolation("missing \"type\" field".into())),
                Some(tag) if !KNOWN_TYPES.contains(&tag) => {
                    Err(Error::UnknownMessageType(tag.to_string()))
                }
                Some(_) => Err(Error::SchemaViolation(e.to_string())),
            }
        }
    }
}

const KNOWN_TYPES: &[&str] = &[
    "user_message",
    "permission_response",
    "interrupt",
    "set_model",
    "set_permission_mode",
    "presence_query",
    "slash_command",
    "set_adapter",
    "queue_message",
    "update_queued_message",
    "cancel_queued_message",
];

#[cfg(test)]
mod tests {
    use super::*;
    use bc_domain::message::PermissionBehavior;

    #[test]
    fn parses_user_message() {
        let req = parse_request(r#"{"type":"user_message","content":"hi"}"#).unwrap();
        match req {
            ConsumerRequest::UserMessage {
                content,
                session_id,
                images,
            } => {
                assert_eq!(content, "hi");
                assert!(session_id.is_none());
                assert!(images.is_empty());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn parses_permission_response() {
        let req = parse_request(
            r#"{"type":"permission_response","request_id":"r1","behavior":"deny","message":"no"}"#,
        )
        .unwrap();
        match req {
            ConsumerRequest::PermissionResponse(p) => {
                assert_eq!(p.request_id, "r1");
                assert_eq!(p.behavior, PermissionBehavior::Deny);
                assert_eq!(p.message.as_deref(), Some("no"));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn non_json_is_invalid_frame() {
        let err = parse_request("not json").unwrap_err();
        assert_eq!(err.kind(), "invalid_frame");
    }

    #[test]
    fn unknown_tag_is_unknown_message_type() {
        let err = parse_request(r#"{"type":"reboot"}"#).unwrap_err();
        assert_eq!(err.kind(), "unknown_message_type");
    }

    #[test]
    fn bad_fields_are_schema_violation() {
        // user_message with missing required content.
        let err = parse_request(r#"{"type":"user_message"}"#).unwrap_err();
        assert_eq!(err.kind(), "schema_violation");

        let err = parse_request(r#"{"content":"hi"}"#).unwrap_err();
        assert_eq!(err.kind(), "schema_violation");
    }
}
