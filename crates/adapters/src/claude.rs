//! Inverted-connection adapter for the Claude CLI.
//!
//! The CLI dials the broker (`/ws/cli/<session>`) and speaks newline-delimited
//! JSON: `user` / `assistant` / `system` / `stream_event` / `result` records
//! plus a `control_request` / `control_response` side channel for interrupts,
//! permissions, and the initialize handshake. `connect` parks on the
//! rendezvous table until the CLI gateway delivers the socket.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use bc_domain::error::{Error, Result};
use bc_domain::message::{
    ContentBlock, McpServer, ModelUsage, PermissionBehavior, PermissionRequest,
    PermissionResponsePayload, ResultPayload, ResultStatus, Role, SessionInitPayload,
    UnifiedMessage, UnifiedPayload,
};
use bc_domain::state::SessionStatus;

use crate::rendezvous::{CliSocket, SocketRegistry};
use crate::traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendChannel, BackendSession,
    ConnectOptions, MESSAGE_CHANNEL_CAPACITY,
};

pub const ADAPTER_NAME: &str = "claude";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub struct ClaudeAdapter {
    rendezvous: Arc<SocketRegistry>,
    connect_timeout: Duration,
}

impl ClaudeAdapter {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            rendezvous: Arc::new(SocketRegistry::new()),
            connect_timeout,
        }
    }

    pub fn rendezvous(&self) -> &Arc<SocketRegistry> {
        &self.rendezvous
    }
}

#[async_trait::async_trait]
impl BackendAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
            availability: Availability::Local,
            teams: true,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<BackendSession> {
        let socket = self
            .rendezvous
            .register(ADAPTER_NAME, &opts.session_id, self.connect_timeout)
            .await?;
        let CliSocket {
            outgoing,
            mut incoming,
        } = socket;

        let (msg_tx, messages) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let session_id = opts.session_id.clone();
        tokio::spawn(async move {
            while let Some(line) = incoming.recv().await {
                let value: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(session_id = %session_id, error = %e, "dropping unparseable CLI line");
                        continue;
                    }
                };
                if let Some(msg) = wire_to_unified(&value) {
                    if msg_tx.send(msg).await.is_err() {
                        return;
                    }
                }
            }
            let _ = msg_tx
                .send(UnifiedMessage::transport_failure("CLI connection closed"))
                .await;
        });

        Ok(BackendSession {
            session_id: opts.session_id,
            channel: Arc::new(ClaudeChannel {
                outgoing: Mutex::new(Some(outgoing)),
            }),
            messages,
        })
    }

    fn is_inverted(&self) -> bool {
        true
    }

    fn deliver_socket(&self, session_id: &str, socket: CliSocket) -> bool {
        self.rendezvous.deliver(session_id, socket)
    }

    fn cancel_pending(&self, session_id: &str) {
        self.rendezvous.cancel(session_id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ClaudeChannel {
    /// Taken on close; sends fail with `SessionClosed` afterwards.
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
}

impl ClaudeChannel {
    fn sender(&self) -> Result<mpsc::Sender<String>> {
        self.outgoing.lock().clone().ok_or(Error::SessionClosed)
    }
}

#[async_trait::async_trait]
impl BackendChannel for ClaudeChannel {
    async fn send(&self, msg: UnifiedMessage) -> Result<()> {
        let Some(line) = unified_to_wire(&msg)? else {
            return Ok(());
        };
        self.sender()?
            .send(line)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    async fn send_raw(&self, line: String) -> Result<()> {
        self.sender()?
            .send(line)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    async fn close(&self) {
        self.outgoing.lock().take();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire → unified
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Translate one CLI record. `None` drops the record (not consumer-relevant).
pub fn wire_to_unified(value: &Value) -> Option<UnifiedMessage> {
    match value.get("type")?.as_str()? {
        "system" => match value.get("subtype").and_then(Value::as_str) {
            Some("init") => Some(session_init_from(value)),
            Some("status") => {
                let status = match value.get("status").and_then(Value::as_str) {
                    Some("idle") => Some(SessionStatus::Idle),
                    Some("running") => Some(SessionStatus::Running),
                    Some("compacting") => Some(SessionStatus::Compacting),
                    _ => None,
                };
                let permission_mode = value
                    .get("permissionMode")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if status.is_none() && permission_mode.is_none() {
                    return None;
                }
                Some(UnifiedMessage::new(
                    UnifiedPayload::StatusChange {
                        status,
                        permission_mode,
                    },
                    Role::System,
                ))
            }
            _ => None,
        },
        "assistant" => {
            let content = parse_content(value.get("message")?.get("content")?);
            let mut msg = UnifiedMessage::new(
                UnifiedPayload::StreamEvent { event: Value::Null },
                Role::Assistant,
            );
            msg.content = content;
            Some(msg)
        }
        "stream_event" => {
            let mut msg = UnifiedMessage::new(
                UnifiedPayload::StreamEvent {
                    event: value.get("event").cloned().unwrap_or(Value::Null),
                },
                Role::Assistant,
            );
            if let Some(content) = value
                .get("event")
                .and_then(|e| e.get("content"))
                .map(parse_content)
            {
                msg.content = content;
            }
            Some(msg)
        }
        "result" => Some(UnifiedMessage::new(
            UnifiedPayload::Result(result_from(value)),
            Role::System,
        )),
        "control_request" => control_request_from(value),
        "control_response" => {
            let response = value.get("response")?;
            Some(UnifiedMessage::new(
                UnifiedPayload::ControlResponse {
                    request_id: response.get("request_id")?.as_str()?.to_string(),
                    success: response.get("subtype").and_then(Value::as_str) == Some("success"),
                    response: response.get("response").cloned().unwrap_or(Value::Null),
                },
                Role::System,
            ))
        }
        "tool_progress" => Some(UnifiedMessage::new(
            UnifiedPayload::ToolProgress {
                tool_call_id: value
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                progress: value.get("progress").cloned().unwrap_or(Value::Null),
            },
            Role::Tool,
        )),
        // The CLI echoes user turns back; the broker already has them.
        "user" => None,
        _ => None,
    }
}

fn session_init_from(value: &Value) -> UnifiedMessage {
    let str_list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let mcp_servers = value
        .get("mcp_servers")
        .and_then(Value::as_array)
        .map(|servers| {
            servers
                .iter()
                .filter_map(|s| {
                    Some(McpServer {
                        name: s.get("name")?.as_str()?.to_string(),
                        status: s.get("status").and_then(Value::as_str).map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    UnifiedMessage::new(
        UnifiedPayload::SessionInit(SessionInitPayload {
            session_id: value
                .get("session_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            model: value.get("model").and_then(Value::as_str).map(str::to_string),
            cwd: value.get("cwd").and_then(Value::as_str).map(str::to_string),
            permission_mode: value
                .get("permissionMode")
                .and_then(Value::as_str)
                .map(str::to_string),
            tools: str_list("tools"),
            mcp_servers,
            slash_commands: str_list("slash_commands"),
            skills: str_list("skills"),
        }),
        Role::System,
    )
}

fn result_from(value: &Value) -> ResultPayload {
    let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or("");
    let is_error = value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(subtype != "success");

    let usage = value
        .get("modelUsage")
        .and_then(Value::as_object)
        .map(|models| {
            models
                .iter()
                .map(|(model, usage)| ModelUsage {
                    model: model.clone(),
                    input_tokens: usage
                        .get("inputTokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    output_tokens: usage
                        .get("outputTokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    context_window: usage
                        .get("contextWindow")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                })
                .collect()
        })
        .unwrap_or_default();

    ResultPayload {
        status: if is_error {
            ResultStatus::Failed
        } else {
            ResultStatus::Success
        },
        is_error,
        error: value
            .get("error")
            .or_else(|| if is_error { value.get("result") } else { None })
            .and_then(Value::as_str)
            .map(str::to_string),
        total_cost_usd: value
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        num_turns: value.get("num_turns").and_then(Value::as_u64).unwrap_or(0),
        duration_ms: value.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
        lines_added: value.get("lines_added").and_then(Value::as_u64).unwrap_or(0),
        lines_removed: value
            .get("lines_removed")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        usage,
    }
}

fn control_request_from(value: &Value) -> Option<UnifiedMessage> {
    let request = value.get("request")?;
    match request.get("subtype")?.as_str()? {
        "can_use_tool" => {
            let mut hints = Map::new();
            if let Some(suggestions) = request.get("permission_suggestions") {
                hints.insert("permission_suggestions".into(), suggestions.clone());
            }
            Some(UnifiedMessage::new(
                UnifiedPayload::PermissionRequest(PermissionRequest {
                    request_id: value.get("request_id")?.as_str()?.to_string(),
                    tool_name: request
                        .get("tool_name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    tool_call_id: request
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    input: request.get("input").cloned().unwrap_or(Value::Null),
                    timestamp: chrono::Utc::now(),
                    hints,
                }),
                Role::System,
            ))
        }
        // Hook callbacks and other control traffic stay inside the adapter.
        _ => None,
    }
}

fn parse_content(value: &Value) -> Vec<ContentBlock> {
    serde_json::from_value(value.clone()).unwrap_or_else(|_| {
        value
            .as_str()
            .map(|text| vec![ContentBlock::text(text)])
            .unwrap_or_default()
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unified → wire
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Translate one outbound message to its NDJSON line. `Ok(None)` means the
/// message has no wire form for this protocol.
pub fn unified_to_wire(msg: &UnifiedMessage) -> Result<Option<String>> {
    let value = match &msg.payload {
        UnifiedPayload::UserMessage => json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": content_to_wire(&msg.content),
            },
        }),
        UnifiedPayload::Interrupt => control_request(json!({ "subtype": "interrupt" })),
        UnifiedPayload::PermissionResponse(response) => permission_response_to_wire(response),
        UnifiedPayload::ConfigurationChange {
            model,
            permission_mode,
        } => {
            // One control request per changed field; model wins the slot if
            // both are set (the caller splits combined changes).
            if let Some(model) = model {
                control_request(json!({ "subtype": "set_model", "model": model }))
            } else if let Some(mode) = permission_mode {
                control_request(json!({ "subtype": "set_permission_mode", "mode": mode }))
            } else {
                return Ok(None);
            }
        }
        _ => return Ok(None),
    };

    serde_json::to_string(&value).map(Some).map_err(Into::into)
}

/// The raw initialize handshake line sent by the capabilities policy.
pub fn initialize_request_line(request_id: &str) -> String {
    control_request_with_id(request_id, json!({ "subtype": "initialize" })).to_string()
}

fn control_request(request: Value) -> Value {
    control_request_with_id(&uuid::Uuid::new_v4().to_string(), request)
}

fn control_request_with_id(request_id: &str, request: Value) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": request,
    })
}

fn permission_response_to_wire(response: &PermissionResponsePayload) -> Value {
    let mut inner = json!({
        "behavior": match response.behavior {
            PermissionBehavior::Allow => "allow",
            PermissionBehavior::Deny => "deny",
        },
    });
    if let Some(input) = &response.updated_input {
        inner["updatedInput"] = input.clone();
    }
    if let Some(permissions) = &response.updated_permissions {
        inner["updatedPermissions"] = permissions.clone();
    }
    if let Some(message) = &response.message {
        inner["message"] = Value::String(message.clone());
    }
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": response.request_id,
            "response": inner,
        },
    })
}

fn content_to_wire(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
            ContentBlock::Image { media_type, data } => json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data },
            }),
            ContentBlock::ToolUse { id, name, input } => json!({
                "type": "tool_use", "id": id, "name": name, "input": input,
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
        })
        .collect()
}
