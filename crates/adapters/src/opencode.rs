//! Adapter for an opencode server (HTTP + SSE).
//!
//! The only adapter that does not own a process or socket: messages go out
//! as HTTP POSTs and responses stream back over the server's `/event` SSE
//! feed, filtered down to our session.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bc_domain::error::{Error, Result};
use bc_domain::message::{
    ContentBlock, PermissionBehavior, PermissionRequest, ResultPayload, ResultStatus, Role,
    SessionInitPayload, UnifiedMessage, UnifiedPayload,
};

use crate::sse::drain_data_lines;
use crate::traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendChannel, BackendSession,
    ConnectOptions, MESSAGE_CHANNEL_CAPACITY,
};

pub const ADAPTER_NAME: &str = "opencode";

#[derive(Debug)]
pub struct OpencodeAdapter {
    base_url: String,
    connect_timeout: Duration,
    client: reqwest::Client,
}

impl OpencodeAdapter {
    pub fn new(base_url: String, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            connect_timeout,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for OpencodeAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
            availability: Availability::Both,
            teams: false,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<BackendSession> {
        let connect = async {
            // Create (or resume) the server-side session.
            let agent_session_id = match opts
                .adapter_options
                .get("opencode_session_id")
                .and_then(Value::as_str)
            {
                Some(existing) if opts.resume => existing.to_string(),
                _ => {
                    let created: Value = self
                        .client
                        .post(format!("{}/session", self.base_url))
                        .json(&json!({}))
                        .send()
                        .await
                        .map_err(|e| connect_failed(e.to_string()))?
                        .error_for_status()
                        .map_err(|e| connect_failed(e.to_string()))?
                        .json()
                        .await
                        .map_err(|e| connect_failed(e.to_string()))?;
                    created
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| connect_failed("session create response missing id".into()))?
                }
            };

            // Subscribe to the event feed before returning so no events are lost.
            let events = self
                .client
                .get(format!("{}/event", self.base_url))
                .send()
                .await
                .map_err(|e| connect_failed(e.to_string()))?
                .error_for_status()
                .map_err(|e| connect_failed(e.to_string()))?;

            Ok::<_, Error>((agent_session_id, events))
        };

        let (agent_session_id, events) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| Error::HandshakeTimeout {
                adapter: ADAPTER_NAME.to_string(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })??;

        let (msg_tx, messages) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let _ = msg_tx
            .send(UnifiedMessage::new(
                UnifiedPayload::SessionInit(SessionInitPayload {
                    session_id: opts.session_id.clone(),
                    ..Default::default()
                }),
                Role::System,
            ))
            .await;

        let cancel = CancellationToken::new();
        let reader_cancel = cancel.clone();
        let reader_session = agent_session_id.clone();
        tokio::spawn(async move {
            let mut stream = events.bytes_stream();
            let mut buffer = String::new();
            loop {
                let chunk = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                let Some(Ok(chunk)) = chunk else {
                    let _ = msg_tx
                        .send(UnifiedMessage::transport_failure("opencode event stream ended"))
                        .await;
                    break;
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                for data in drain_data_lines(&mut buffer) {
                    let Ok(value) = serde_json::from_str::<Value>(&data) else {
                        continue;
                    };
                    if let Some(msg) = event_to_unified(&reader_session, &value) {
                        if msg_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(BackendSession {
            session_id: opts.session_id,
            channel: Arc::new(OpencodeChannel {
                client: self.client.clone(),
                base_url: self.base_url.clone(),
                agent_session_id,
                cancel,
            }),
            messages,
        })
    }
}

fn connect_failed(message: String) -> Error {
    Error::ConnectFailed {
        adapter: ADAPTER_NAME.to_string(),
        message,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct OpencodeChannel {
    client: reqwest::Client,
    base_url: String,
    agent_session_id: String,
    cancel: CancellationToken,
}

impl OpencodeChannel {
    async fn post(&self, path: String, body: Value) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        self.client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::TranslateError(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::TranslateError(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BackendChannel for OpencodeChannel {
    async fn send(&self, msg: UnifiedMessage) -> Result<()> {
        let sid = &self.agent_session_id;
        match &msg.payload {
            UnifiedPayload::UserMessage => {
                self.post(
                    format!("/session/{sid}/message"),
                    json!({ "parts": [{ "type": "text", "text": msg.text() }] }),
                )
                .await
            }
            UnifiedPayload::Interrupt => {
                self.post(format!("/session/{sid}/abort"), json!({})).await
            }
            UnifiedPayload::PermissionResponse(response) => {
                let decision = match response.behavior {
                    PermissionBehavior::Allow => "once",
                    PermissionBehavior::Deny => "reject",
                };
                self.post(
                    format!("/session/{sid}/permissions/{}", response.request_id),
                    json!({ "response": decision }),
                )
                .await
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event translation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn event_to_unified(agent_session_id: &str, value: &Value) -> Option<UnifiedMessage> {
    let props = value.get("properties")?;
    let event_session = props
        .get("sessionID")
        .or_else(|| props.get("part").and_then(|p| p.get("sessionID")))
        .and_then(Value::as_str)?;
    if event_session != agent_session_id {
        return None;
    }

    match value.get("type")?.as_str()? {
        "message.part.updated" => {
            let part = props.get("part")?;
            if part.get("type").and_then(Value::as_str) != Some("text") {
                return None;
            }
            let text = part.get("text").and_then(Value::as_str).unwrap_or("");
            let mut msg = UnifiedMessage::new(
                UnifiedPayload::StreamEvent {
                    event: json!({ "delta": text }),
                },
                Role::Assistant,
            );
            msg.content = vec![ContentBlock::text(text)];
            Some(msg)
        }
        "permission.updated" => Some(UnifiedMessage::new(
            UnifiedPayload::PermissionRequest(PermissionRequest {
                request_id: props.get("id")?.as_str()?.to_string(),
                tool_name: props
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("tool")
                    .to_string(),
                tool_call_id: None,
                input: props.get("metadata").cloned().unwrap_or(Value::Null),
                timestamp: chrono::Utc::now(),
                hints: serde_json::Map::new(),
            }),
            Role::System,
        )),
        "session.idle" => Some(UnifiedMessage::new(
            UnifiedPayload::Result(ResultPayload {
                status: ResultStatus::Success,
                is_error: false,
                error: None,
                total_cost_usd: props
                    .get("cost")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                num_turns: 1,
                duration_ms: 0,
                lines_added: 0,
                lines_removed: 0,
                usage: Vec::new(),
            }),
            Role::System,
        )),
        "session.error" => Some(UnifiedMessage::new(
            UnifiedPayload::Result(ResultPayload::transport_failure(
                props
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("opencode error"),
            )),
            Role::System,
        )),
        _ => None,
    }
}
