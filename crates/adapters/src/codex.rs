//! Child-process adapter for the Codex CLI (`codex proto`).
//!
//! The protocol is NDJSON both ways: the broker writes *submissions*
//! (`{"id", "op": {...}}`), the CLI emits *events* (`{"id", "msg": {...}}`).
//! Token usage arrives in `token_count` events ahead of `task_complete`, so
//! the translator keeps the last usage seen and folds it into the result.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use bc_domain::error::{Error, Result};
use bc_domain::message::{
    ContentBlock, ModelUsage, PermissionBehavior, PermissionRequest, ResultPayload, ResultStatus,
    Role, SessionInitPayload, UnifiedMessage, UnifiedPayload,
};
use bc_domain::state::SessionStatus;

use crate::ndjson::{spawn_child, ChildPipes};
use crate::traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendChannel, BackendSession,
    ConnectOptions, SlashExecutor, SlashOutcome, MESSAGE_CHANNEL_CAPACITY,
};

pub const ADAPTER_NAME: &str = "codex";

const NATIVE_COMMANDS: &[&str] = &["/compact", "/new", "/review", "/rename"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub struct CodexAdapter {
    binary: String,
    connect_timeout: Duration,
}

impl CodexAdapter {
    pub fn new(binary: String, connect_timeout: Duration) -> Self {
        Self {
            binary,
            connect_timeout,
        }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for CodexAdapter {
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
        } = spawn_child(
            ADAPTER_NAME,
            &self.binary,
            &["proto".to_string()],
            opts.cwd.as_deref(),
        )?;

        // Handshake: the CLI announces itself with `session_configured`.
        let configured = tokio::time::timeout(self.connect_timeout, async {
            while let Some(line) = stdout_rx.recv().await {
                if let Ok(value) = serde_json::from_str::<Value>(&line) {
                    if value["msg"]["type"] == "session_configured" {
                        return Some(value);
                    }
                }
            }
            None
        })
        .await;

        let configured = match configured {
            Ok(Some(value)) => value,
            Ok(None) => {
                let _ = kill_tx.try_send(());
                return Err(Error::ConnectFailed {
                    adapter: ADAPTER_NAME.to_string(),
                    message: "backend exited before session_configured".into(),
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
        let _ = msg_tx
            .send(session_init_from(&opts.session_id, &configured))
            .await;

        tokio::spawn(async move {
            let mut state = TranslatorState::default();
            while let Some(line) = stdout_rx.recv().await {
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if let Some(msg) = wire_to_unified(&mut state, &value) {
                    if msg_tx.send(msg).await.is_err() {
                        return;
                    }
                }
            }
            let _ = msg_tx
                .send(UnifiedMessage::transport_failure("codex process exited"))
                .await;
        });

        Ok(BackendSession {
            session_id: opts.session_id,
            channel: Arc::new(CodexChannel {
                stdin: Mutex::new(Some(stdin_tx)),
                kill: kill_tx,
            }),
            messages,
        })
    }

    fn slash_executor(&self, channel: Arc<dyn BackendChannel>) -> Option<Box<dyn SlashExecutor>> {
        Some(Box::new(CodexSlashExecutor { channel }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CodexChannel {
    stdin: Mutex<Option<mpsc::Sender<String>>>,
    kill: mpsc::Sender<()>,
}

impl CodexChannel {
    fn sender(&self) -> Result<mpsc::Sender<String>> {
        self.stdin.lock().clone().ok_or(Error::SessionClosed)
    }
}

#[async_trait::async_trait]
impl BackendChannel for CodexChannel {
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
        self.stdin.lock().take();
        let _ = self.kill.try_send(());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Native slash commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CodexSlashExecutor {
    channel: Arc<dyn BackendChannel>,
}

#[async_trait::async_trait]
impl SlashExecutor for CodexSlashExecutor {
    fn handles(&self, command: &str) -> bool {
        let name = command.split_whitespace().next().unwrap_or(command);
        NATIVE_COMMANDS.contains(&name)
    }

    async fn execute(&self, command: &str) -> Result<Option<SlashOutcome>> {
        let started = Instant::now();
        let mut parts = command.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or(command);
        let argument = parts.next().map(str::trim).unwrap_or("");

        let (op, content) = match name {
            "/compact" => (json!({ "type": "compact" }), "Compacting conversation"),
            "/new" => (json!({ "type": "new_conversation" }), "Started a new conversation"),
            "/review" => (
                json!({ "type": "review", "prompt": argument }),
                "Review started",
            ),
            "/rename" => (
                json!({ "type": "rename", "name": argument }),
                "Session renamed",
            ),
            _ => return Ok(None),
        };

        self.channel.send_raw(submission(op).to_string()).await?;
        Ok(Some(SlashOutcome {
            content: content.to_string(),
            source: "emulated",
            duration_ms: started.elapsed().as_millis() as u64,
        }))
    }

    fn supported_commands(&self) -> Vec<String> {
        NATIVE_COMMANDS.iter().map(|c| c.to_string()).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire → unified
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct TranslatorState {
    last_usage: Option<ModelUsage>,
    model: Option<String>,
}

fn session_init_from(session_id: &str, configured: &Value) -> UnifiedMessage {
    let msg = &configured["msg"];
    UnifiedMessage::new(
        UnifiedPayload::SessionInit(SessionInitPayload {
            session_id: session_id.to_string(),
            model: msg.get("model").and_then(Value::as_str).map(str::to_string),
            cwd: msg.get("cwd").and_then(Value::as_str).map(str::to_string),
            permission_mode: msg
                .get("approval_policy")
                .and_then(Value::as_str)
                .map(str::to_string),
            ..Default::default()
        }),
        Role::System,
    )
}

fn wire_to_unified(state: &mut TranslatorState, value: &Value) -> Option<UnifiedMessage> {
    let msg = value.get("msg")?;
    match msg.get("type")?.as_str()? {
        "task_started" => Some(UnifiedMessage::new(
            UnifiedPayload::StatusChange {
                status: Some(SessionStatus::Running),
                permission_mode: None,
            },
            Role::System,
        )),
        "agent_message_delta" => Some(UnifiedMessage::new(
            UnifiedPayload::StreamEvent {
                event: json!({ "delta": msg.get("delta").cloned().unwrap_or(Value::Null) }),
            },
            Role::Assistant,
        )),
        "agent_message" => {
            let text = msg.get("message").and_then(Value::as_str).unwrap_or("");
            let mut unified = UnifiedMessage::new(
                UnifiedPayload::StreamEvent { event: Value::Null },
                Role::Assistant,
            );
            unified.content = vec![ContentBlock::text(text)];
            Some(unified)
        }
        "token_count" => {
            let info = msg.get("info")?;
            let totals = info.get("total_token_usage")?;
            state.last_usage = Some(ModelUsage {
                model: state.model.clone().unwrap_or_else(|| "codex".into()),
                input_tokens: totals.get("input_tokens").and_then(Value::as_u64)?,
                output_tokens: totals
                    .get("output_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                context_window: info
                    .get("model_context_window")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            });
            None
        }
        "task_complete" => Some(UnifiedMessage::new(
            UnifiedPayload::Result(ResultPayload {
                status: ResultStatus::Success,
                is_error: false,
                error: None,
                total_cost_usd: 0.0,
                num_turns: 1,
                duration_ms: 0,
                lines_added: 0,
                lines_removed: 0,
                usage: state.last_usage.take().into_iter().collect(),
            }),
            Role::System,
        )),
        "exec_approval_request" => {
            let call_id = msg.get("call_id").and_then(Value::as_str)?;
            Some(UnifiedMessage::new(
                UnifiedPayload::PermissionRequest(PermissionRequest {
                    request_id: call_id.to_string(),
                    tool_name: "exec".into(),
                    tool_call_id: Some(call_id.to_string()),
                    input: json!({
                        "command": msg.get("command").cloned().unwrap_or(Value::Null),
                        "cwd": msg.get("cwd").cloned().unwrap_or(Value::Null),
                    }),
                    timestamp: chrono::Utc::now(),
                    hints: serde_json::Map::new(),
                }),
                Role::System,
            ))
        }
        "error" => Some(UnifiedMessage::new(
            UnifiedPayload::Result(ResultPayload::transport_failure(
                msg.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("codex error"),
            )),
            Role::System,
        )),
        "session_configured" => {
            state.model = msg.get("model").and_then(Value::as_str).map(str::to_string);
            None
        }
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unified → wire
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn submission(op: Value) -> Value {
    json!({ "id": uuid::Uuid::new_v4().to_string(), "op": op })
}

fn unified_to_wire(msg: &UnifiedMessage) -> Result<Option<String>> {
    let op = match &msg.payload {
        UnifiedPayload::UserMessage => json!({
            "type": "user_input",
            "items": [{ "type": "text", "text": msg.text() }],
        }),
        UnifiedPayload::Interrupt => json!({ "type": "interrupt" }),
        UnifiedPayload::PermissionResponse(response) => json!({
            "type": "exec_approval",
            "id": response.request_id,
            "decision": match response.behavior {
                PermissionBehavior::Allow => "approved",
                PermissionBehavior::Deny => "denied",
            },
        }),
        UnifiedPayload::ConfigurationChange {
            model,
            permission_mode,
        } => {
            let mut op = json!({ "type": "override_turn_context" });
            if let Some(model) = model {
                op["model"] = Value::String(model.clone());
            }
            if let Some(mode) = permission_mode {
                op["approval_policy"] = Value::String(mode.clone());
            }
            op
        }
        _ => return Ok(None),
    };

    serde_json::to_string(&submission(op))
        .map(Some)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_count_folds_into_task_complete() {
        let mut state = TranslatorState::default();

        let tokens = json!({"id": "1", "msg": {
            "type": "token_count",
            "info": {
                "total_token_usage": {"input_tokens": 900, "output_tokens": 100},
                "model_context_window": 128000,
            },
        }});
        assert!(wire_to_unified(&mut state, &tokens).is_none());

        let complete = json!({"id": "1", "msg": {"type": "task_complete"}});
        let msg = wire_to_unified(&mut state, &complete).unwrap();
        match msg.payload {
            UnifiedPayload::Result(r) => {
                assert_eq!(r.status, ResultStatus::Success);
                assert_eq!(r.usage.len(), 1);
                assert_eq!(r.usage[0].input_tokens, 900);
                assert_eq!(r.usage[0].context_window, 128_000);
            }
            other => panic!("expected result, got {other:?}"),
        }

        // Usage is consumed; a second completion has none.
        let msg = wire_to_unified(&mut state, &complete).unwrap();
        match msg.payload {
            UnifiedPayload::Result(r) => assert!(r.usage.is_empty()),
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn approval_request_round_trip() {
        let mut state = TranslatorState::default();
        let event = json!({"id": "1", "msg": {
            "type": "exec_approval_request",
            "call_id": "c7",
            "command": ["rm", "-rf", "build"],
        }});
        let msg = wire_to_unified(&mut state, &event).unwrap();
        let request_id = match &msg.payload {
            UnifiedPayload::PermissionRequest(req) => req.request_id.clone(),
            other => panic!("expected permission_request, got {other:?}"),
        };

        let response =
            UnifiedMessage::permission_response(bc_domain::message::PermissionResponsePayload {
                request_id,
                behavior: PermissionBehavior::Allow,
                updated_input: None,
                updated_permissions: None,
                message: None,
            });
        let line = unified_to_wire(&response).unwrap().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["op"]["type"], "exec_approval");
        assert_eq!(value["op"]["id"], "c7");
        assert_eq!(value["op"]["decision"], "approved");
    }

    #[test]
    fn executor_handles_native_commands_only() {
        struct NullChannel;
        #[async_trait::async_trait]
        impl BackendChannel for NullChannel {
            async fn send(&self, _msg: UnifiedMessage) -> Result<()> {
                Ok(())
            }
            async fn send_raw(&self, _line: String) -> Result<()> {
                Ok(())
            }
            async fn close(&self) {}
        }

        let executor = CodexSlashExecutor {
            channel: Arc::new(NullChannel),
        };
        assert!(executor.handles("/compact"));
        assert!(executor.handles("/rename my session"));
        assert!(!executor.handles("/help"));
        assert_eq!(executor.supported_commands().len(), NATIVE_COMMANDS.len());
    }

    #[tokio::test]
    async fn executor_emits_submission() {
        struct Capture(Mutex<Vec<String>>);
        #[async_trait::async_trait]
        impl BackendChannel for Capture {
            async fn send(&self, _msg: UnifiedMessage) -> Result<()> {
                Ok(())
            }
            async fn send_raw(&self, line: String) -> Result<()> {
                self.0.lock().push(line);
                Ok(())
            }
            async fn close(&self) {}
        }

        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let executor = CodexSlashExecutor {
            channel: capture.clone(),
        };
        let outcome = executor.execute("/compact").await.unwrap().unwrap();
        assert_eq!(outcome.source, "emulated");

        let lines = capture.0.lock();
        let value: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["op"]["type"], "compact");
    }
}
