//! Adapter for ACP agents (JSON-RPC 2.0 over stdio).
//!
//! Unlike the flat NDJSON protocols, ACP pairs requests with responses:
//! `session/prompt` is a broker→agent request whose response carries the stop
//! reason, and `session/request_permission` is an agent→broker request whose
//! JSON-RPC id must be echoed by the eventual permission response. The
//! translator tracks both pending directions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use bc_domain::error::{Error, Result};
use bc_domain::message::{
    ContentBlock, PermissionBehavior, PermissionRequest, ResultPayload, ResultStatus, Role,
    SessionInitPayload, UnifiedMessage, UnifiedPayload,
};

use crate::ndjson::{spawn_child, ChildPipes};
use crate::traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendChannel, BackendSession,
    ConnectOptions, MESSAGE_CHANNEL_CAPACITY,
};

pub const ADAPTER_NAME: &str = "acp";

const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug)]
pub struct AcpAdapter {
    binary: String,
    connect_timeout: Duration,
}

impl AcpAdapter {
    pub fn new(binary: String, connect_timeout: Duration) -> Self {
        Self {
            binary,
            connect_timeout,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared translator state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct AcpShared {
    next_id: AtomicI64,
    /// The agent's own session id, captured during the handshake.
    agent_session_id: String,
    /// JSON-RPC ids of in-flight `session/prompt` requests.
    prompt_ids: Mutex<HashSet<i64>>,
    /// Our permission request id → (agent's JSON-RPC id, offered options).
    pending_permissions: Mutex<HashMap<String, (Value, Value)>>,
}

impl AcpShared {
    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl BackendAdapter for AcpAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: false,
            availability: Availability::Local,
            teams: false,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<BackendSession> {
        let ChildPipes {
            pid: _,
            stdin_tx,
            mut stdout_rx,
            kill_tx,
        } = spawn_child(ADAPTER_NAME, &self.binary, &[], opts.cwd.as_deref())?;

        // Handshake: initialize, then session/new (or session/load on resume).
        let handshake = tokio::time::timeout(self.connect_timeout, async {
            send_line(
                &stdin_tx,
                request(1, "initialize", json!({ "protocolVersion": PROTOCOL_VERSION })),
            )
            .await?;
            await_response(&mut stdout_rx, 1).await?;

            let method = if opts.resume { "session/load" } else { "session/new" };
            let cwd = opts
                .cwd
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ".".into());
            send_line(
                &stdin_tx,
                request(2, method, json!({ "cwd": cwd, "mcpServers": [] })),
            )
            .await?;
            let response = await_response(&mut stdout_rx, 2).await?;
            response
                .get("result")
                .and_then(|r| r.get("sessionId"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::ConnectFailed {
                    adapter: ADAPTER_NAME.to_string(),
                    message: "session/new response missing sessionId".into(),
                })
        })
        .await;

        let agent_session_id = match handshake {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                let _ = kill_tx.try_send(());
                return Err(e);
            }
            Err(_) => {
                let _ = kill_tx.try_send(());
                return Err(Error::HandshakeTimeout {
                    adapter: ADAPTER_NAME.to_string(),
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                });
            }
        };

        let shared = Arc::new(AcpShared {
            next_id: AtomicI64::new(3),
            agent_session_id,
            prompt_ids: Mutex::new(HashSet::new()),
            pending_permissions: Mutex::new(HashMap::new()),
        });

        let (msg_tx, messages) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let _ = msg_tx
            .send(UnifiedMessage::new(
                UnifiedPayload::SessionInit(SessionInitPayload {
                    session_id: opts.session_id.clone(),
                    cwd: opts.cwd.as_ref().map(|p| p.display().to_string()),
                    ..Default::default()
                }),
                Role::System,
            ))
            .await;

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(line) = stdout_rx.recv().await {
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if let Some(msg) = wire_to_unified(&reader_shared, &value) {
                    if msg_tx.send(msg).await.is_err() {
                        return;
                    }
                }
            }
            let _ = msg_tx
                .send(UnifiedMessage::transport_failure("acp agent exited"))
                .await;
        });

        Ok(BackendSession {
            session_id: opts.session_id,
            channel: Arc::new(AcpChannel {
                stdin: Mutex::new(Some(stdin_tx)),
                kill: kill_tx,
                shared,
            }),
            messages,
        })
    }
}

async fn send_line(stdin: &mpsc::Sender<String>, value: Value) -> Result<()> {
    stdin
        .send(value.to_string())
        .await
        .map_err(|_| Error::SessionClosed)
}

async fn await_response(stdout: &mut mpsc::Receiver<String>, id: i64) -> Result<Value> {
    while let Some(line) = stdout.recv().await {
        if let Ok(value) = serde_json::from_str::<Value>(&line) {
            if value.get("id").and_then(Value::as_i64) == Some(id) {
                if let Some(error) = value.get("error") {
                    return Err(Error::ConnectFailed {
                        adapter: ADAPTER_NAME.to_string(),
                        message: error.to_string(),
                    });
                }
                return Ok(value);
            }
        }
    }
    Err(Error::ConnectFailed {
        adapter: ADAPTER_NAME.to_string(),
        message: "agent exited during handshake".into(),
    })
}

fn request(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct AcpChannel {
    stdin: Mutex<Option<mpsc::Sender<String>>>,
    kill: mpsc::Sender<()>,
    shared: Arc<AcpShared>,
}

#[async_trait::async_trait]
impl BackendChannel for AcpChannel {
    async fn send(&self, msg: UnifiedMessage) -> Result<()> {
        let sender = self.stdin.lock().clone().ok_or(Error::SessionClosed)?;
        let Some(value) = unified_to_wire(&self.shared, &msg) else {
            return Ok(());
        };
        sender
            .send(value.to_string())
            .await
            .map_err(|_| Error::SessionClosed)
    }

    async fn close(&self) {
        self.stdin.lock().take();
        let _ = self.kill.try_send(());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unified → wire
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn unified_to_wire(shared: &AcpShared, msg: &UnifiedMessage) -> Option<Value> {
    match &msg.payload {
        UnifiedPayload::UserMessage => {
            let id = shared.next_id();
            shared.prompt_ids.lock().insert(id);
            Some(request(
                id,
                "session/prompt",
                json!({
                    "sessionId": shared.agent_session_id,
                    "prompt": [{ "type": "text", "text": msg.text() }],
                }),
            ))
        }
        UnifiedPayload::Interrupt => Some(json!({
            "jsonrpc": "2.0",
            "method": "session/cancel",
            "params": { "sessionId": shared.agent_session_id },
        })),
        UnifiedPayload::PermissionResponse(response) => {
            let (rpc_id, options) = shared
                .pending_permissions
                .lock()
                .remove(&response.request_id)?;
            let option_id = select_option(&options, response.behavior);
            Some(json!({
                "jsonrpc": "2.0",
                "id": rpc_id,
                "result": {
                    "outcome": { "outcome": "selected", "optionId": option_id },
                },
            }))
        }
        UnifiedPayload::ConfigurationChange {
            permission_mode: Some(mode),
            ..
        } => Some(request(
            shared.next_id(),
            "session/set_mode",
            json!({ "sessionId": shared.agent_session_id, "modeId": mode }),
        )),
        _ => None,
    }
}

/// Pick the agent-offered option matching the consumer's decision.
fn select_option(options: &Value, behavior: PermissionBehavior) -> String {
    let wanted = match behavior {
        PermissionBehavior::Allow => "allow_once",
        PermissionBehavior::Deny => "reject_once",
    };
    options
        .as_array()
        .and_then(|opts| {
            opts.iter()
                .find(|o| o.get("kind").and_then(Value::as_str) == Some(wanted))
                .or_else(|| opts.first())
        })
        .and_then(|o| o.get("optionId"))
        .and_then(Value::as_str)
        .unwrap_or(wanted)
        .to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire → unified
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn wire_to_unified(shared: &AcpShared, value: &Value) -> Option<UnifiedMessage> {
    // Agent → broker request (carries both method and id).
    if let (Some(method), Some(_)) = (
        value.get("method").and_then(Value::as_str),
        value.get("id"),
    ) {
        if method == "session/request_permission" {
            return Some(permission_request_from(shared, value));
        }
        return None;
    }

    // Notification.
    if let Some(method) = value.get("method").and_then(Value::as_str) {
        if method == "session/update" {
            return session_update_from(value.get("params")?);
        }
        return None;
    }

    // Response to one of our requests: only prompt responses matter.
    if let Some(id) = value.get("id").and_then(Value::as_i64) {
        if shared.prompt_ids.lock().remove(&id) {
            return Some(prompt_result_from(value));
        }
    }
    None
}

fn permission_request_from(shared: &AcpShared, value: &Value) -> UnifiedMessage {
    let params = value.get("params").cloned().unwrap_or(Value::Null);
    let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
    let request_id = uuid::Uuid::new_v4().to_string();

    shared.pending_permissions.lock().insert(
        request_id.clone(),
        (
            value.get("id").cloned().unwrap_or(Value::Null),
            params.get("options").cloned().unwrap_or(Value::Null),
        ),
    );

    let mut hints = serde_json::Map::new();
    if let Some(options) = params.get("options") {
        hints.insert("options".into(), options.clone());
    }

    UnifiedMessage::new(
        UnifiedPayload::PermissionRequest(PermissionRequest {
            request_id,
            tool_name: tool_call
                .get("title")
                .or_else(|| tool_call.get("kind"))
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_string(),
            tool_call_id: tool_call
                .get("toolCallId")
                .and_then(Value::as_str)
                .map(str::to_string),
            input: tool_call.get("rawInput").cloned().unwrap_or(Value::Null),
            timestamp: chrono::Utc::now(),
            hints,
        }),
        Role::System,
    )
}

fn session_update_from(params: &Value) -> Option<UnifiedMessage> {
    let update = params.get("update")?;
    match update.get("sessionUpdate")?.as_str()? {
        "agent_message_chunk" => {
            let text = update
                .get("content")
                .and_then(|c| c.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let mut msg = UnifiedMessage::new(
                UnifiedPayload::StreamEvent {
                    event: json!({ "delta": text }),
                },
                Role::Assistant,
            );
            msg.content = vec![ContentBlock::text(text)];
            Some(msg)
        }
        "tool_call" | "tool_call_update" => Some(UnifiedMessage::new(
            UnifiedPayload::ToolProgress {
                tool_call_id: update
                    .get("toolCallId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                progress: update.clone(),
            },
            Role::Tool,
        )),
        "current_mode_update" => Some(UnifiedMessage::new(
            UnifiedPayload::StatusChange {
                status: None,
                permission_mode: update
                    .get("currentModeId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            Role::System,
        )),
        _ => None,
    }
}

fn prompt_result_from(value: &Value) -> UnifiedMessage {
    let stop_reason = value
        .get("result")
        .and_then(|r| r.get("stopReason"))
        .and_then(Value::as_str)
        .unwrap_or("end_turn");
    let is_error = value.get("error").is_some();
    UnifiedMessage::new(
        UnifiedPayload::Result(ResultPayload {
            status: if is_error {
                ResultStatus::Failed
            } else {
                ResultStatus::Success
            },
            is_error,
            error: value.get("error").map(|e| e.to_string()),
            total_cost_usd: 0.0,
            num_turns: 1,
            duration_ms: 0,
            lines_added: 0,
            lines_removed: 0,
            usage: Vec::new(),
        }),
        Role::System,
    )
    .tap_stop_reason(stop_reason)
}

trait TapStopReason {
    fn tap_stop_reason(self, stop_reason: &str) -> Self;
}

impl TapStopReason for UnifiedMessage {
    fn tap_stop_reason(mut self, stop_reason: &str) -> Self {
        self.metadata
            .insert("stop_reason".into(), Value::String(stop_reason.to_string()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<AcpShared> {
        Arc::new(AcpShared {
            next_id: AtomicI64::new(3),
            agent_session_id: "agent-1".into(),
            prompt_ids: Mutex::new(HashSet::new()),
            pending_permissions: Mutex::new(HashMap::new()),
        })
    }

    #[test]
    fn prompt_request_and_response_pair() {
        let shared = shared();
        let out = unified_to_wire(&shared, &UnifiedMessage::user("do it")).unwrap();
        assert_eq!(out["method"], "session/prompt");
        assert_eq!(out["params"]["sessionId"], "agent-1");
        let id = out["id"].as_i64().unwrap();

        // The response to that id becomes the turn result.
        let response = json!({ "jsonrpc": "2.0", "id": id, "result": { "stopReason": "end_turn" }});
        let msg = wire_to_unified(&shared, &response).unwrap();
        assert_eq!(msg.type_name(), "result");
        assert_eq!(msg.metadata["stop_reason"], "end_turn");

        // Unknown ids are ignored.
        let stray = json!({ "jsonrpc": "2.0", "id": 999, "result": {} });
        assert!(wire_to_unified(&shared, &stray).is_none());
    }

    #[test]
    fn permission_response_echoes_jsonrpc_id() {
        let shared = shared();
        let incoming = json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "session/request_permission",
            "params": {
                "sessionId": "agent-1",
                "toolCall": { "toolCallId": "tc1", "title": "run tests", "rawInput": {"cmd": "cargo test"} },
                "options": [
                    { "optionId": "yes", "kind": "allow_once" },
                    { "optionId": "no", "kind": "reject_once" },
                ],
            },
        });
        let msg = wire_to_unified(&shared, &incoming).unwrap();
        let request_id = match &msg.payload {
            UnifiedPayload::PermissionRequest(req) => {
                assert_eq!(req.tool_call_id.as_deref(), Some("tc1"));
                req.request_id.clone()
            }
            other => panic!("expected permission_request, got {other:?}"),
        };

        let response =
            UnifiedMessage::permission_response(bc_domain::message::PermissionResponsePayload {
                request_id,
                behavior: PermissionBehavior::Deny,
                updated_input: None,
                updated_permissions: None,
                message: None,
            });
        let out = unified_to_wire(&shared, &response).unwrap();
        assert_eq!(out["id"], 42);
        assert_eq!(out["result"]["outcome"]["optionId"], "no");
        // Consumed: replaying the same response produces nothing.
        assert!(unified_to_wire(&shared, &response).is_none());
    }

    #[test]
    fn agent_chunk_becomes_stream_event() {
        let shared = shared();
        let update = json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {
                "sessionId": "agent-1",
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": { "type": "text", "text": "hi" },
                },
            },
        });
        let msg = wire_to_unified(&shared, &update).unwrap();
        assert_eq!(msg.type_name(), "stream_event");
        assert_eq!(msg.text(), "hi");
    }
}
