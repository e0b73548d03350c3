//! Child-process adapter for the Gemini CLI (`gemini --broker-io`).
//!
//! The simplest of the stdio protocols: flat NDJSON records with a `type`
//! field in both directions and no side channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use bc_domain::error::{Error, Result};
use bc_domain::message::{
    ContentBlock, ModelUsage, PermissionBehavior, PermissionRequest, ResultPayload, ResultStatus,
    Role, SessionInitPayload, UnifiedMessage, UnifiedPayload,
};
use bc_domain::state::SessionStatus;

use crate::ndjson::{spawn_child, ChildPipes};
use crate::traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendChannel, BackendSession,
    ConnectOptions, MESSAGE_CHANNEL_CAPACITY,
};

pub const ADAPTER_NAME: &str = "gemini";

#[derive(Debug)]
pub struct GeminiAdapter {
    binary: String,
    connect_timeout: Duration,
}

impl GeminiAdapter {
    pub fn new(binary: String, connect_timeout: Duration) -> Self {
        Self {
            binary,
            connect_timeout,
        }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
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
        } = spawn_child(
            ADAPTER_NAME,
            &self.binary,
            &["--broker-io".to_string()],
            opts.cwd.as_deref(),
        )?;

        let init = tokio::time::timeout(self.connect_timeout, async {
            while let Some(line) = stdout_rx.recv().await {
                if let Ok(value) = serde_json::from_str::<Value>(&line) {
                    if value["type"] == "init" {
                        return Some(value);
                    }
                }
            }
            None
        })
        .await;

        let init = match init {
            Ok(Some(value)) => value,
            Ok(None) => {
                let _ = kill_tx.try_send(());
                return Err(Error::ConnectFailed {
                    adapter: ADAPTER_NAME.to_string(),
                    message: "backend exited before init".into(),
                });
            }
            Err(_) => {
                let _ = kill_tx.try_send(());
                return Err(Error::HandshakeTimeout {
                    adapter: ADAPTER_NAME.to_string(),
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                });
            }
        };

        let (msg_tx, messages) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let _ = msg_tx.send(session_init_from(&opts.session_id, &init)).await;

        tokio::spawn(async move {
            while let Some(line) = stdout_rx.recv().await {
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if let Some(msg) = wire_to_unified(&value) {
                    if msg_tx.send(msg).await.is_err() {
                        return;
                    }
                }
            }
            let _ = msg_tx
                .send(UnifiedMessage::transport_failure("gemini process exited"))
                .await;
        });

        Ok(BackendSession {
            session_id: opts.session_id,
            channel: Arc::new(GeminiChannel {
                stdin: Mutex::new(Some(stdin_tx)),
                kill: kill_tx,
            }),
            messages,
        })
    }
}

struct GeminiChannel {
    stdin: Mutex<Option<mpsc::Sender<String>>>,
    kill: mpsc::Sender<()>,
}

#[async_trait::async_trait]
impl BackendChannel for GeminiChannel {
    async fn send(&self, msg: UnifiedMessage) -> Result<()> {
        let Some(line) = unified_to_wire(&msg)? else {
            return Ok(());
        };
        let sender = self.stdin.lock().clone().ok_or(Error::SessionClosed)?;
        sender.send(line).await.map_err(|_| Error::SessionClosed)
    }

    async fn close(&self) {
        self.stdin.lock().take();
        let _ = self.kill.try_send(());
    }
}

fn session_init_from(session_id: &str, init: &Value) -> UnifiedMessage {
    UnifiedMessage::new(
        UnifiedPayload::SessionInit(SessionInitPayload {
            session_id: session_id.to_string(),
            model: init.get("model").and_then(Value::as_str).map(str::to_string),
            cwd: init.get("cwd").and_then(Value::as_str).map(str::to_string),
            ..Default::default()
        }),
        Role::System,
    )
}

fn wire_to_unified(value: &Value) -> Option<UnifiedMessage> {
    match value.get("type")?.as_str()? {
        "delta" => Some(UnifiedMessage::new(
            UnifiedPayload::StreamEvent {
                event: json!({ "delta": value.get("text").cloned().unwrap_or(Value::Null) }),
            },
            Role::Assistant,
        )),
        "message" => {
            let mut msg = UnifiedMessage::new(
                UnifiedPayload::StreamEvent { event: Value::Null },
                Role::Assistant,
            );
            msg.content = vec![ContentBlock::text(
                value.get("text").and_then(Value::as_str).unwrap_or(""),
            )];
            Some(msg)
        }
        "status" => {
            let status = match value.get("state").and_then(Value::as_str)? {
                "idle" => SessionStatus::Idle,
                "running" => SessionStatus::Running,
                "compacting" => SessionStatus::Compacting,
                _ => return None,
            };
            Some(UnifiedMessage::new(
                UnifiedPayload::StatusChange {
                    status: Some(status),
                    permission_mode: None,
                },
                Role::System,
            ))
        }
        "permission_request" => Some(UnifiedMessage::new(
            UnifiedPayload::PermissionRequest(PermissionRequest {
                request_id: value.get("id")?.as_str()?.to_string(),
                tool_name: value
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                tool_call_id: None,
                input: value.get("args").cloned().unwrap_or(Value::Null),
                timestamp: chrono::Utc::now(),
                hints: serde_json::Map::new(),
            }),
            Role::System,
        )),
        "done" => {
            let stats = value.get("stats").cloned().unwrap_or(Value::Null);
            let usage = stats
                .get("input_tokens")
                .and_then(Value::as_u64)
                .map(|input_tokens| ModelUsage {
                    model: stats
                        .get("model")
                        .and_then(Value::as_str)
                        .unwrap_or("gemini")
                        .to_string(),
                    input_tokens,
                    output_tokens: stats
                        .get("output_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    context_window: stats
                        .get("context_window")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                })
                .into_iter()
                .collect();
            Some(UnifiedMessage::new(
                UnifiedPayload::Result(ResultPayload {
                    status: ResultStatus::Success,
                    is_error: false,
                    error: None,
                    total_cost_usd: 0.0,
                    num_turns: 1,
                    duration_ms: stats.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
                    lines_added: 0,
                    lines_removed: 0,
                    usage,
                }),
                Role::System,
            ))
        }
        "error" => Some(UnifiedMessage::new(
            UnifiedPayload::Result(ResultPayload::transport_failure(
                value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("gemini error"),
            )),
            Role::System,
        )),
        _ => None,
    }
}

fn unified_to_wire(msg: &UnifiedMessage) -> Result<Option<String>> {
    let value = match &msg.payload {
        UnifiedPayload::UserMessage => json!({ "type": "user", "content": msg.text() }),
        UnifiedPayload::Interrupt => json!({ "type": "interrupt" }),
        UnifiedPayload::PermissionResponse(response) => json!({
            "type": "permission",
            "id": response.request_id,
            "allow": response.behavior == PermissionBehavior::Allow,
        }),
        UnifiedPayload::ConfigurationChange { model, .. } => match model {
            Some(model) => json!({ "type": "set_model", "model": model }),
            None => return Ok(None),
        },
        _ => return Ok(None),
    };
    serde_json::to_string(&value).map(Some).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_and_done_translate() {
        let delta = json!({"type": "delta", "text": "hel"});
        let msg = wire_to_unified(&delta).unwrap();
        assert_eq!(msg.type_name(), "stream_event");

        let done = json!({"type": "done", "stats": {
            "model": "gemini-pro",
            "input_tokens": 500,
            "output_tokens": 80,
            "context_window": 1000000,
            "duration_ms": 2300,
        }});
        let msg = wire_to_unified(&done).unwrap();
        match msg.payload {
            UnifiedPayload::Result(r) => {
                assert_eq!(r.status, ResultStatus::Success);
                assert_eq!(r.duration_ms, 2300);
                assert_eq!(r.usage[0].model, "gemini-pro");
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn permission_round_trip_uses_backend_id() {
        let request = json!({"type": "permission_request", "id": "p5", "tool": "shell"});
        let msg = wire_to_unified(&request).unwrap();
        let request_id = match &msg.payload {
            UnifiedPayload::PermissionRequest(req) => req.request_id.clone(),
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
        let line = unified_to_wire(&response).unwrap().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], "p5");
        assert_eq!(value["allow"], false);
    }

    #[test]
    fn unknown_records_are_dropped() {
        assert!(wire_to_unified(&json!({"type": "heartbeat"})).is_none());
    }
}
