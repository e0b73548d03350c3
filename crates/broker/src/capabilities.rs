//! The capabilities / initialize handshake.
//!
//! `Idle ─send→ AwaitingInitialize ─(success|error|timeout)→ Idle`, one
//! outstanding request per session. Adapters without a raw control channel
//! report `Unsupported`; their capabilities arrive via `session_init`
//! instead and are synthesized here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use bc_adapters::BackendChannel;
use bc_domain::event::{DomainEvent, EventBus};
use bc_domain::message::SessionInitPayload;
use bc_domain::state::{CommandInfo, ModelInfo, SessionCapabilities};
use bc_domain::Error;
use bc_protocol::ConsumerEvent;
use bc_sessions::session::PendingInitialize;
use bc_sessions::Session;

use crate::broadcast;

pub struct CapabilitiesPolicy {
    bus: EventBus,
    timeout: Duration,
}

impl CapabilitiesPolicy {
    pub fn new(bus: EventBus, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    /// Kick off the initialize handshake. No-op when one is already
    /// outstanding or the backend is detached.
    pub async fn send_initialize(&self, session: &Arc<Session>) {
        if session.has_pending_initialize() {
            return;
        }
        let Some(channel) = session.backend_channel() else {
            return;
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let line = bc_adapters::claude::initialize_request_line(&request_id);

        let timer = {
            let session = session.clone();
            let bus = self.bus.clone();
            let request_id = request_id.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(pending) = session.take_pending_initialize(&request_id) {
                    drop(pending);
                    tracing::warn!(session_id = session.id(), "initialize handshake timed out");
                    bus.emit(DomainEvent::CapabilitiesTimeout {
                        session_id: session.id().to_string(),
                    });
                    broadcast::broadcast(
                        &session,
                        ConsumerEvent::Error {
                            kind: "handshake_timeout".into(),
                            message: "backend did not answer the initialize request".into(),
                        },
                    );
                }
            })
        };

        if !session.set_pending_initialize(PendingInitialize {
            request_id: request_id.clone(),
            timer,
        }) {
            return;
        }

        match channel.send_raw(line).await {
            Ok(()) => {}
            Err(Error::Unsupported(_)) => {
                // No raw control channel: capabilities will arrive in
                // session_init; don't let the timer fire spuriously.
                if let Some(pending) = session.take_pending_initialize(&request_id) {
                    pending.timer.abort();
                }
            }
            Err(e) => {
                if let Some(pending) = session.take_pending_initialize(&request_id) {
                    pending.timer.abort();
                }
                tracing::warn!(session_id = session.id(), error = %e, "initialize send failed");
            }
        }
    }

    /// A `control_response` arrived from the backend.
    pub fn handle_control_response(
        &self,
        session: &Arc<Session>,
        request_id: &str,
        success: bool,
        response: &Value,
    ) {
        let Some(pending) = session.take_pending_initialize(request_id) else {
            tracing::debug!(
                session_id = session.id(),
                request_id,
                "control_response for unknown request"
            );
            return;
        };
        pending.timer.abort();

        let capabilities = if success {
            parse_capabilities(response)
        } else {
            // Fall back to what the adapter already told us, if anything.
            let known = session.state().slash_commands;
            if known.is_empty() {
                tracing::warn!(session_id = session.id(), "initialize failed, no capabilities");
                return;
            }
            synthesize(&known, session.state().model.as_deref())
        };

        self.apply(session, capabilities);
    }

    /// Capabilities implied by a (possibly repeated) `session_init`, for
    /// adapters without an initialize handshake. A later `session_init`
    /// replaces the record atomically and re-broadcasts `capabilities_ready`.
    pub fn apply_session_init(&self, session: &Arc<Session>, init: &SessionInitPayload) {
        if session.has_pending_initialize() {
            // The control-channel handshake is in flight; it wins.
            return;
        }
        if init.slash_commands.is_empty() && session.state().capabilities.is_none() {
            return;
        }
        let capabilities = synthesize(&init.slash_commands, init.model.as_deref());
        self.apply(session, capabilities);
    }

    /// Cancel any outstanding handshake; safe to call repeatedly.
    pub fn cancel(&self, session: &Arc<Session>) {
        if let Some(pending) = session.clear_pending_initialize() {
            pending.timer.abort();
        }
    }

    fn apply(&self, session: &Arc<Session>, capabilities: SessionCapabilities) {
        let commands = capabilities.commands.clone();
        let models = capabilities.models.clone();

        session.update_state(|state, _| {
            let mut next = state.clone();
            next.capabilities = Some(capabilities.clone());
            (next != *state).then_some(next)
        });
        session.with_registry(|registry| {
            registry.register_cli_commands(commands.clone());
        });

        broadcast::broadcast(
            session,
            ConsumerEvent::CapabilitiesReady {
                commands: commands.clone(),
                models: models.clone(),
            },
        );
        self.bus.emit(DomainEvent::CapabilitiesReady {
            session_id: session.id().to_string(),
            commands: commands.len(),
            models: models.len(),
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_capabilities(response: &Value) -> SessionCapabilities {
    let commands = response
        .get("commands")
        .and_then(Value::as_array)
        .map(|commands| {
            commands
                .iter()
                .filter_map(|c| {
                    Some(CommandInfo {
                        name: c.get("name")?.as_str()?.to_string(),
                        description: c
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        argument_hint: c
                            .get("argument_hint")
                            .or_else(|| c.get("argumentHint"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let models = response
        .get("models")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| match m {
                    Value::String(id) => Some(ModelInfo {
                        id: id.clone(),
                        display_name: None,
                    }),
                    Value::Object(_) => Some(ModelInfo {
                        id: m
                            .get("id")
                            .or_else(|| m.get("value"))?
                            .as_str()?
                            .to_string(),
                        display_name: m
                            .get("display_name")
                            .or_else(|| m.get("displayName"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    }),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    SessionCapabilities {
        commands,
        models,
        account: response.get("account").cloned(),
        received_at: Utc::now(),
    }
}

fn synthesize(slash_commands: &[String], model: Option<&str>) -> SessionCapabilities {
    SessionCapabilities {
        commands: slash_commands
            .iter()
            .map(|name| CommandInfo {
                name: name.clone(),
                description: None,
                argument_hint: None,
            })
            .collect(),
        models: model
            .map(|id| {
                vec![ModelInfo {
                    id: id.to_string(),
                    display_name: None,
                }]
            })
            .unwrap_or_default(),
        account: None,
        received_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_sessions::{ConsumerIdentity, SessionLimits};
    use serde_json::json;

    fn session() -> Arc<Session> {
        Arc::new(Session::new(
            "123e4567-e89b-42d3-a456-426614174000",
            "claude",
            SessionLimits::default(),
        ))
    }

    fn policy() -> CapabilitiesPolicy {
        CapabilitiesPolicy::new(EventBus::new(), Duration::from_secs(10))
    }

    fn pending(session: &Arc<Session>, request_id: &str) {
        let timer = tokio::spawn(async {});
        assert!(session.set_pending_initialize(PendingInitialize {
            request_id: request_id.into(),
            timer,
        }));
    }

    #[tokio::test]
    async fn successful_response_populates_capabilities() {
        let session = session();
        let (_, consumer) = session.add_consumer(ConsumerIdentity::anonymous(1));
        let policy = policy();
        pending(&session, "req-1");

        let response = json!({
            "commands": (0..42).map(|i| json!({"name": format!("/cmd{i}")})).collect::<Vec<_>>(),
            "models": ["opus", "sonnet", "haiku"],
        });
        policy.handle_control_response(&session, "req-1", true, &response);

        let capabilities = session.state().capabilities.unwrap();
        assert_eq!(capabilities.commands.len(), 42);
        assert_eq!(capabilities.models.len(), 3);
        assert!(!session.has_pending_initialize());

        // Exactly one capabilities_ready broadcast.
        let frames = consumer.queue.drain(100);
        let ready: Vec<_> = frames
            .iter()
            .filter(|f| f.payload.type_name() == "capabilities_ready")
            .collect();
        assert_eq!(ready.len(), 1);

        // Registry picked up the commands.
        session.with_registry(|registry| {
            assert!(registry.contains("/cmd0"));
            assert!(registry.contains("/cmd41"));
        });
    }

    #[tokio::test]
    async fn stray_response_is_ignored() {
        let session = session();
        let policy = policy();
        pending(&session, "req-1");

        policy.handle_control_response(&session, "other", true, &json!({}));
        // The pending slot is untouched.
        assert!(session.has_pending_initialize());
    }

    #[tokio::test]
    async fn error_response_synthesizes_from_known_commands() {
        let session = session();
        let policy = policy();
        session.update_state(|state, _| {
            let mut next = state.clone();
            next.slash_commands = vec!["/compact".into(), "/help".into()];
            Some(next)
        });
        pending(&session, "req-1");

        policy.handle_control_response(&session, "req-1", false, &json!({}));
        let capabilities = session.state().capabilities.unwrap();
        assert_eq!(capabilities.commands.len(), 2);
    }

    #[tokio::test]
    async fn session_init_defers_to_inflight_handshake() {
        let session = session();
        let policy = policy();
        pending(&session, "req-1");

        let init = SessionInitPayload {
            session_id: session.id().to_string(),
            slash_commands: vec!["/a".into()],
            ..Default::default()
        };
        policy.apply_session_init(&session, &init);
        assert!(session.state().capabilities.is_none());

        // Without a handshake in flight, it applies.
        policy.cancel(&session);
        policy.apply_session_init(&session, &init);
        assert_eq!(session.state().capabilities.unwrap().commands.len(), 1);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let session = session();
        let policy = policy();
        pending(&session, "req-1");
        policy.cancel(&session);
        policy.cancel(&session);
        assert!(!session.has_pending_initialize());
    }
}
